use std::io;

use windows_sys::Win32::Networking::WinInet::{
    InternetSetOptionW, INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED,
};
use winreg::enums::{HKEY_CURRENT_USER, KEY_READ};
use winreg::RegKey;

use super::{ProxySnapshot, SystemProxyBackend};
use crate::error::{Error, Result};

const INTERNET_SETTINGS_KEY: &str = "Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings";
const PROXY_ENABLE: &str = "ProxyEnable";
const PROXY_SERVER: &str = "ProxyServer";

/// WinINet proxy settings of the current user.
#[derive(Debug, Default)]
pub struct RegistryProxyBackend;

impl RegistryProxyBackend {
    pub fn new() -> Self {
        Self
    }
}

fn unavailable(error: io::Error) -> Error {
    Error::SystemProxyUnavailable(error.to_string())
}

fn delete_if_present(key: &RegKey, name: &str) -> io::Result<()> {
    match key.delete_value(name) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

impl SystemProxyBackend for RegistryProxyBackend {
    fn read_state(&self) -> Result<ProxySnapshot> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let key = match hkcu.open_subkey_with_flags(INTERNET_SETTINGS_KEY, KEY_READ) {
            Ok(key) => key,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(ProxySnapshot::default()),
            Err(error) => return Err(unavailable(error)),
        };
        let proxy_enable = key.get_value::<u32, _>(PROXY_ENABLE).ok();
        let proxy_server = key
            .get_value::<String, _>(PROXY_SERVER)
            .ok()
            .filter(|server| !server.trim().is_empty());
        Ok(ProxySnapshot {
            proxy_enable,
            proxy_server,
        })
    }

    fn write_state(&self, state: &ProxySnapshot) -> Result<()> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let (key, _) = hkcu.create_subkey(INTERNET_SETTINGS_KEY).map_err(unavailable)?;

        match state.proxy_enable {
            Some(value) => key.set_value(PROXY_ENABLE, &value),
            None => delete_if_present(&key, PROXY_ENABLE),
        }
        .map_err(unavailable)?;

        match state.proxy_server.as_deref().filter(|server| !server.trim().is_empty()) {
            Some(server) => key.set_value(PROXY_SERVER, &server),
            None => delete_if_present(&key, PROXY_SERVER),
        }
        .map_err(unavailable)
    }

    fn notify_settings_changed(&self) -> Result<()> {
        unsafe {
            InternetSetOptionW(std::ptr::null_mut(), INTERNET_OPTION_SETTINGS_CHANGED, std::ptr::null_mut(), 0);
            InternetSetOptionW(std::ptr::null_mut(), INTERNET_OPTION_REFRESH, std::ptr::null_mut(), 0);
        }
        Ok(())
    }
}
