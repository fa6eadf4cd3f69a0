//! Launch-at-logon registration.

use std::path::Path;

pub const TASK_NAME: &str = "Onibox";
pub const AUTOSTART_ARG: &str = "--autostart";

/// OS registrar for starting the app at logon. `false` means the OS refused.
pub trait AutostartBackend: Send {
    fn enable(&self, executable: &Path) -> bool;
    fn disable(&self) -> bool;
}

/// Platforms without a registrar refuse every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedAutostart;

impl AutostartBackend for UnsupportedAutostart {
    fn enable(&self, _executable: &Path) -> bool {
        tracing::warn!(target: "autostart", "autostart is not supported on this platform");
        false
    }

    fn disable(&self) -> bool {
        true
    }
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Task Scheduler definition: logon trigger, highest available run level,
/// `<exe> --autostart` in the executable's directory.
pub fn task_xml(executable: &Path, user_id: &str) -> String {
    let working_dir = executable
        .parent()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();
    let user = escape_xml(user_id);
    let command = escape_xml(&executable.display().to_string());
    let args = escape_xml(AUTOSTART_ARG);
    let working_dir = escape_xml(&working_dir);

    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo>
    <Author>{user}</Author>
  </RegistrationInfo>
  <Triggers>
    <LogonTrigger>
      <Enabled>true</Enabled>
    </LogonTrigger>
  </Triggers>
  <Principals>
    <Principal id="Author">
      <UserId>{user}</UserId>
      <LogonType>InteractiveToken</LogonType>
      <RunLevel>HighestAvailable</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <AllowHardTerminate>true</AllowHardTerminate>
    <StartWhenAvailable>true</StartWhenAvailable>
    <RunOnlyIfNetworkAvailable>false</RunOnlyIfNetworkAvailable>
    <AllowStartOnDemand>true</AllowStartOnDemand>
    <Enabled>true</Enabled>
    <Hidden>false</Hidden>
    <ExecutionTimeLimit>PT72H</ExecutionTimeLimit>
    <Priority>7</Priority>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>{command}</Command>
      <Arguments>{args}</Arguments>
      <WorkingDirectory>{working_dir}</WorkingDirectory>
    </Exec>
  </Actions>
</Task>"#
    )
}

#[cfg(target_os = "windows")]
pub use self::schtasks::ScheduledTaskAutostart;

#[cfg(target_os = "windows")]
mod schtasks {
    use std::io::Read;
    use std::os::windows::process::CommandExt;
    use std::path::Path;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use super::{task_xml, AutostartBackend, TASK_NAME};
    use crate::engine::CREATE_NO_WINDOW;

    const SCHTASKS_TIMEOUT: Duration = Duration::from_secs(5);

    /// Registers a Task Scheduler logon task through `schtasks.exe`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ScheduledTaskAutostart;

    fn current_user() -> String {
        let user = std::env::var("USERNAME").unwrap_or_default();
        match std::env::var("USERDOMAIN") {
            Ok(domain) if !domain.is_empty() => format!("{domain}\\{user}"),
            _ => user,
        }
    }

    /// Runs schtasks; with `ignore_errors` a failure that printed nothing to
    /// stderr still counts as success.
    fn run_schtasks(args: &[&str], ignore_errors: bool) -> bool {
        let child = Command::new("schtasks.exe")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .creation_flags(CREATE_NO_WINDOW)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(error) => {
                tracing::warn!(target: "autostart", %error, "schtasks could not be started");
                return false;
            }
        };

        let deadline = Instant::now() + SCHTASKS_TIMEOUT;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(target: "autostart", "schtasks timed out");
                    return false;
                }
            }
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        if status.success() {
            return true;
        }
        tracing::warn!(target: "autostart", code = ?status.code(), stderr = stderr.trim(), "schtasks failed");
        ignore_errors && stderr.trim().is_empty()
    }

    impl AutostartBackend for ScheduledTaskAutostart {
        fn enable(&self, executable: &Path) -> bool {
            let nonce = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_nanos())
                .unwrap_or_default();
            let xml_path = std::env::temp_dir()
                .join(format!("onibox-autostart-{}-{nonce}.xml", std::process::id()));

            let xml = task_xml(executable, &current_user());
            let mut bytes = vec![0xFF, 0xFE];
            bytes.extend(xml.encode_utf16().flat_map(u16::to_le_bytes));
            if let Err(error) = std::fs::write(&xml_path, bytes) {
                tracing::warn!(target: "autostart", %error, "task definition could not be written");
                return false;
            }

            let xml_arg = xml_path.display().to_string();
            let ok = run_schtasks(&["/Create", "/TN", TASK_NAME, "/XML", &xml_arg, "/F"], false);
            let _ = std::fs::remove_file(&xml_path);
            ok
        }

        fn disable(&self) -> bool {
            run_schtasks(&["/Delete", "/TN", TASK_NAME, "/F"], true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_xml_escapes_and_passes_autostart_flag() {
        let xml = task_xml(Path::new("/opt/R&D/onibox"), "CORP\\o'neil");
        assert!(xml.contains("<Command>/opt/R&amp;D/onibox</Command>"));
        assert!(xml.contains("<Arguments>--autostart</Arguments>"));
        assert!(xml.contains("<WorkingDirectory>/opt/R&amp;D</WorkingDirectory>"));
        assert!(xml.contains("<UserId>CORP\\o&apos;neil</UserId>"));
        assert!(xml.contains("<LogonTrigger>"));
    }

    #[test]
    fn unsupported_registrar_refuses_enable() {
        assert!(!UnsupportedAutostart.enable(Path::new("/bin/onibox")));
        assert!(UnsupportedAutostart.disable());
    }
}
