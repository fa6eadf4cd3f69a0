use std::ptr;

use windows_sys::Win32::Foundation::{GetLastError, ERROR_NOT_FOUND};
use windows_sys::Win32::Security::Credentials::{
    CredDeleteW, CredFree, CredReadW, CredWriteW, CREDENTIALW, CRED_PERSIST_LOCAL_MACHINE,
    CRED_TYPE_GENERIC,
};

use super::{Credential, SecretBackend};
use crate::error::Result;

const TARGET_PREFIX: &str = "Onibox:BasicAuth:";
const MAX_SECRET_BLOB_BYTES: usize = 512;

/// Generic credentials in the Windows Credential Manager.
#[derive(Debug, Default)]
pub struct WindowsCredentialStore;

impl WindowsCredentialStore {
    pub fn new() -> Self {
        Self
    }

    fn target_name(target: &str) -> Vec<u16> {
        to_wide(&format!("{TARGET_PREFIX}{target}"))
    }
}

fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(Some(0)).collect()
}

fn from_wide_ptr(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe {
        let len = (0..).take_while(|&i| *ptr.offset(i) != 0).count();
        String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
    }
}

impl SecretBackend for WindowsCredentialStore {
    fn try_read(&self, target: &str) -> Option<Credential> {
        if target.trim().is_empty() {
            return None;
        }
        let name = Self::target_name(target);
        unsafe {
            let mut stored: *mut CREDENTIALW = ptr::null_mut();
            if CredReadW(name.as_ptr(), CRED_TYPE_GENERIC, 0, &mut stored) == 0 || stored.is_null() {
                return None;
            }
            let entry = &*stored;
            let secret = if entry.CredentialBlob.is_null() || entry.CredentialBlobSize == 0 {
                String::new()
            } else {
                let bytes =
                    std::slice::from_raw_parts(entry.CredentialBlob, entry.CredentialBlobSize as usize);
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            };
            let username = from_wide_ptr(entry.UserName);
            CredFree(stored as *const _);
            Some(Credential::new(username, secret))
        }
    }

    fn write(&self, target: &str, credential: &Credential) -> Result<()> {
        if target.trim().is_empty() {
            return Ok(());
        }
        let blob: Vec<u8> = credential
            .secret
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        if blob.len() > MAX_SECRET_BLOB_BYTES {
            tracing::warn!(target: "credential", "secret too long for credential manager, not stored");
            return Ok(());
        }

        let mut name = Self::target_name(target);
        let mut username = to_wide(&credential.username);
        let entry = CREDENTIALW {
            Flags: 0,
            Type: CRED_TYPE_GENERIC,
            TargetName: name.as_mut_ptr(),
            Comment: ptr::null_mut(),
            LastWritten: unsafe { std::mem::zeroed() },
            CredentialBlobSize: blob.len() as u32,
            CredentialBlob: if blob.is_empty() {
                ptr::null_mut()
            } else {
                blob.as_ptr() as *mut u8
            },
            Persist: CRED_PERSIST_LOCAL_MACHINE,
            AttributeCount: 0,
            Attributes: ptr::null_mut(),
            TargetAlias: ptr::null_mut(),
            UserName: username.as_mut_ptr(),
        };
        if unsafe { CredWriteW(&entry, 0) } == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn delete(&self, target: &str) -> Result<()> {
        if target.trim().is_empty() {
            return Ok(());
        }
        let name = Self::target_name(target);
        if unsafe { CredDeleteW(name.as_ptr(), CRED_TYPE_GENERIC, 0) } == 0 {
            let code = unsafe { GetLastError() };
            if code != ERROR_NOT_FOUND {
                return Err(std::io::Error::from_raw_os_error(code as i32).into());
            }
        }
        Ok(())
    }
}
