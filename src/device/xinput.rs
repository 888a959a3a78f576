//! X11 device backend driven through the `xinput` command line tool

use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ActivityFeed, DeviceBackend, DeviceError, DeviceId, DeviceSet};

/// Buffered activity lines per session; bursts beyond this just wait
const FEED_BUFFER: usize = 256;

/// Device backend built on `xinput list`, `xinput --enable/--disable` and
/// `xinput test`
#[derive(Debug, Clone)]
pub struct XInputBackend {
    program: String,
    pattern: Regex,
}

impl XInputBackend {
    /// `pattern` is matched against each `xinput list` line; its first
    /// capture group must be the numeric device id.
    pub fn new(pattern: Regex) -> Self {
        Self {
            program: "xinput".to_string(),
            pattern,
        }
    }

    fn parse_list(&self, listing: &str) -> DeviceSet {
        listing
            .lines()
            .filter_map(|line| self.pattern.captures(line))
            .filter_map(|caps| caps.get(1))
            .filter_map(|id| id.as_str().parse().ok())
            .map(DeviceId)
            .collect()
    }

    async fn run(&self, args: &[&str]) -> Result<String, DeviceError> {
        let command = format!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| DeviceError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn set_enabled(&self, devices: &DeviceSet, enabled: bool) -> Result<(), DeviceError> {
        let flag = if enabled { "--enable" } else { "--disable" };
        let mut failed = Vec::new();

        for id in devices.iter() {
            let id_arg = id.to_string();
            if let Err(e) = self.run(&[flag, &id_arg]).await {
                failed.push((id, e.to_string()));
            }
        }

        if failed.is_empty() {
            return Ok(());
        }

        // A key pulled out mid-session makes xinput fail for its id; that
        // counts as success since there is nothing left to control.
        if let Ok(present) = self.enumerate().await {
            failed.retain(|(id, reason)| {
                if present.contains(*id) {
                    true
                } else {
                    debug!(%id, %reason, "ignoring control failure for vanished device");
                    false
                }
            });
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(DeviceError::Control { failed })
        }
    }
}

#[async_trait]
impl DeviceBackend for XInputBackend {
    async fn enumerate(&self) -> Result<DeviceSet, DeviceError> {
        let listing = self.run(&["list"]).await?;
        Ok(self.parse_list(&listing))
    }

    async fn enable(&self, devices: &DeviceSet) -> Result<(), DeviceError> {
        self.set_enabled(devices, true).await
    }

    async fn disable(&self, devices: &DeviceSet) -> Result<(), DeviceError> {
        self.set_enabled(devices, false).await
    }

    async fn subscribe(&self, devices: &DeviceSet) -> Result<ActivityFeed, DeviceError> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let mut children = Vec::with_capacity(devices.len());
        let mut readers = Vec::with_capacity(devices.len());

        for id in devices.iter() {
            let id_arg = id.to_string();
            let spawned = Command::new(&self.program)
                .args(["test", &id_arg])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            let mut child = match spawned {
                Ok(child) => child,
                Err(source) => {
                    ActivityFeed::with_processes(rx, children, readers)
                        .terminate()
                        .await;
                    return Err(DeviceError::Spawn {
                        command: format!("{} test {}", self.program, id_arg),
                        source,
                    });
                }
            };

            let Some(stdout) = child.stdout.take() else {
                children.push(child);
                ActivityFeed::with_processes(rx, children, readers)
                    .terminate()
                    .await;
                return Err(DeviceError::NoOutput(id));
            };

            let tx = tx.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%id, ?e, "activity feed read failed");
                            break;
                        }
                    }
                }
            }));
            children.push(child);
        }

        debug!(devices = %devices, "activity feeds opened");
        Ok(ActivityFeed::with_processes(rx, children, readers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::RegexBuilder;

    const LISTING: &str = "\
⎡ Virtual core pointer                          \tid=2\t[master pointer  (3)]
⎜   ↳ Virtual core XTEST pointer                \tid=4\t[slave  pointer  (2)]
⎣ Virtual core keyboard                         \tid=3\t[master keyboard (2)]
    ↳ Virtual core XTEST keyboard               \tid=5\t[slave  keyboard (3)]
    ↳ Yubico YubiKey OTP+FIDO+CCID              \tid=16\t[slave  keyboard (3)]
    ↳ AT Translated Set 2 keyboard              \tid=12\t[slave  keyboard (3)]
    ↳ Yubico Yubikey NEO OTP+U2F+CCID           \tid=17\t[slave  keyboard (3)]
";

    fn backend() -> XInputBackend {
        let pattern = RegexBuilder::new(r"yubikey.*?id=(\d+)")
            .case_insensitive(true)
            .build()
            .unwrap();
        XInputBackend::new(pattern)
    }

    #[test]
    fn test_parse_list_extracts_matching_ids_in_order() {
        let devices = backend().parse_list(LISTING);
        assert_eq!(devices.ids(), &[DeviceId(16), DeviceId(17)]);
    }

    #[test]
    fn test_parse_list_without_keys_is_empty() {
        let listing = "⎣ Virtual core keyboard \tid=3\t[master keyboard (2)]\n";
        assert!(backend().parse_list(listing).is_empty());
    }

    #[test]
    fn test_parse_list_skips_unparseable_ids() {
        let listing = "↳ Yubico YubiKey id=99999999999999999999 [slave]\n";
        assert!(backend().parse_list(listing).is_empty());
    }

    /// Stand-in `xinput` that lists key 8 and logs every invocation
    const FAKE_XINPUT: &str = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/calls.log"
case "$1" in
    list) printf '    Yubico YubiKey OTP+FIDO+CCID \tid=8\t[slave  keyboard (3)]\n' ;;
    --disable) [ -n "$FAIL_DISABLE" ] && { echo "device $2 busy" >&2; exit 1; } ;;
    test) echo "key press   36"; exec sleep 60 ;;
esac
exit 0
"#;

    fn fake_backend(dir: &tempfile::TempDir, fail_disable: bool) -> XInputBackend {
        use std::os::unix::fs::PermissionsExt;

        let script = FAKE_XINPUT.replace(
            "$FAIL_DISABLE",
            if fail_disable { "yes" } else { "" },
        );
        let path = dir.path().join("xinput");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut backend = backend();
        backend.program = path.to_string_lossy().into_owned();
        backend
    }

    fn invocations(dir: &tempfile::TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn set(ids: &[u32]) -> DeviceSet {
        ids.iter().copied().map(DeviceId).collect()
    }

    #[tokio::test]
    async fn test_enumerate_runs_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = fake_backend(&dir, false);

        assert_eq!(backend.enumerate().await.unwrap(), set(&[8]));
        assert_eq!(invocations(&dir), vec!["list"]);
    }

    #[tokio::test]
    async fn test_control_failure_for_vanished_device_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = fake_backend(&dir, true);

        backend.disable(&set(&[7])).await.unwrap();

        match backend.disable(&set(&[7, 8])).await.unwrap_err() {
            DeviceError::Control { failed } => {
                let ids: Vec<_> = failed.iter().map(|(id, _)| *id).collect();
                assert_eq!(ids, vec![DeviceId(8)]);
                assert!(failed[0].1.contains("device 8 busy"), "{}", failed[0].1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_enable_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = fake_backend(&dir, false);
        let devices = set(&[8]);

        backend.enable(&devices).await.unwrap();
        backend.enable(&devices).await.unwrap();

        assert_eq!(invocations(&dir), vec!["--enable 8", "--enable 8"]);
    }

    #[tokio::test]
    async fn test_subscribe_streams_activity_and_terminates() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = fake_backend(&dir, false);

        let mut feed = backend.subscribe(&set(&[8])).await.unwrap();
        let line = tokio::time::timeout(std::time::Duration::from_secs(5), feed.next_line())
            .await
            .unwrap();
        assert_eq!(line.as_deref(), Some("key press   36"));

        tokio::time::timeout(std::time::Duration::from_secs(5), feed.terminate())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_reports_spawn_error() {
        let mut backend = backend();
        backend.program = "keylock-test-no-such-binary".to_string();
        let err = backend.enumerate().await.unwrap_err();
        assert!(matches!(err, DeviceError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_failure_reports_spawn_error() {
        let mut backend = backend();
        backend.program = "keylock-test-no-such-binary".to_string();
        let devices: DeviceSet = [DeviceId(16)].into_iter().collect();
        let err = backend.subscribe(&devices).await.unwrap_err();
        assert!(matches!(err, DeviceError::Spawn { .. }));
    }
}
