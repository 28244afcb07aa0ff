// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Device collaborator backed by the `adb` client binary. The ADB server is
//! a shared external resource; this handle owns one serial for the duration
//! of an episode and never touches other devices.

use masbench_core::device::{
    ActionKind, Deadline, DeviceControl, ForegroundApp, InputReceipt, NormalizedAction,
    Observation, Orientation, ScreenGeometry, ShellOutput, SizePx,
};
use masbench_core::error::{HarnessError, HarnessResult};
use masbench_core::timewin::{host_utc_ms, parse_epoch_time_ms};
use masbench_oracles::adb::parse_component;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

pub struct AdbDevice {
    adb_path: String,
    adb_server_socket: Option<String>,
    serial: String,
}

impl AdbDevice {
    pub fn new(serial: &str, adb_server_socket: Option<&str>) -> Self {
        Self {
            adb_path: "adb".to_string(),
            adb_server_socket: adb_server_socket.map(str::to_string),
            serial: serial.to_string(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(socket) = &self.adb_server_socket {
            cmd.env("ADB_SERVER_SOCKET", socket);
        }
        cmd.arg("-s").arg(&self.serial);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    fn wait_with_deadline(
        &self,
        mut child: Child,
        deadline: Deadline,
        what: &str,
    ) -> HarnessResult<(Vec<u8>, Vec<u8>, i32)> {
        loop {
            match child.try_wait()? {
                Some(status) => {
                    let mut stdout = Vec::new();
                    let mut stderr = Vec::new();
                    if let Some(mut out) = child.stdout.take() {
                        out.read_to_end(&mut stdout)?;
                    }
                    if let Some(mut err) = child.stderr.take() {
                        err.read_to_end(&mut stderr)?;
                    }
                    return Ok((stdout, stderr, status.code().unwrap_or(-1)));
                }
                None => {
                    if deadline.expired() {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(HarnessError::DeadlineExpired(what.to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }

    fn run(&self, args: &[&str], deadline: Deadline) -> HarnessResult<(Vec<u8>, Vec<u8>, i32)> {
        let child = self
            .command(args)
            .spawn()
            .map_err(|e| HarnessError::Infra(format!("adb spawn failed: {e}")))?;
        self.wait_with_deadline(child, deadline, &format!("adb {}", args.join(" ")))
    }

    fn shell_text(&mut self, cmd: &str, deadline: Deadline) -> HarnessResult<String> {
        let out = self.run_shell(cmd, deadline)?;
        if out.ok() {
            Ok(out.stdout)
        } else {
            Err(HarnessError::Infra(format!(
                "adb shell {cmd:?} exited {}",
                out.exit_code
            )))
        }
    }

    fn screen_geometry(&mut self, deadline: Deadline) -> ScreenGeometry {
        let size = self
            .shell_text("wm size", deadline)
            .ok()
            .and_then(|out| parse_wm_size(&out));
        ScreenGeometry {
            screenshot_size_px: size,
            logical_screen_size_px: size,
            physical_frame_boundary_px: size.map(|s| {
                masbench_core::device::FrameBoundaryPx {
                    left: 0,
                    top: 0,
                    right: i64::from(s.w),
                    bottom: i64::from(s.h),
                }
            }),
            orientation: size.map(|s| {
                if s.h >= s.w {
                    Orientation::Portrait
                } else {
                    Orientation::Landscape
                }
            }),
        }
    }

    pub fn build_fingerprint(&mut self, deadline: Deadline) -> Option<String> {
        self.shell_text("getprop ro.build.fingerprint", deadline)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

fn parse_wm_size(output: &str) -> Option<SizePx> {
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix("Physical size:") else {
            continue;
        };
        let (w, h) = rest.trim().split_once('x')?;
        return Some(SizePx {
            w: w.trim().parse().ok()?,
            h: h.trim().parse().ok()?,
        });
    }
    None
}

impl DeviceControl for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn observe(&mut self, deadline: Deadline) -> HarnessResult<Observation> {
        let (screenshot, _, code) =
            self.run(&["exec-out", "screencap", "-p"], deadline.sub_deadline(10_000))?;
        let screenshot_png = if code == 0 && !screenshot.is_empty() {
            Some(screenshot)
        } else {
            None
        };

        let focus = self
            .shell_text("dumpsys window windows", deadline.sub_deadline(5_000))
            .ok()
            .and_then(|out| {
                out.lines()
                    .find(|l| l.contains("mCurrentFocus"))
                    .and_then(parse_component)
            });
        let foreground = ForegroundApp {
            package: focus.as_ref().map(|(pkg, _)| pkg.clone()),
            activity: focus.map(|(_, activity)| activity),
        };

        let geometry = self.screen_geometry(deadline.sub_deadline(5_000));

        let device_epoch_time_ms = self
            .shell_text("date +%s%3N", deadline.sub_deadline(1_500))
            .ok()
            .and_then(|out| parse_epoch_time_ms(&out));

        Ok(Observation {
            screenshot_png,
            ui_tree: None,
            foreground,
            geometry,
            notifications: Vec::new(),
            device_epoch_time_ms,
        })
    }

    fn execute(
        &mut self,
        action: &NormalizedAction,
        deadline: Deadline,
    ) -> HarnessResult<InputReceipt> {
        let cmd = match &action.kind {
            ActionKind::Tap { x, y } => format!("input tap {} {}", *x as i64, *y as i64),
            ActionKind::LongPress { x, y } => {
                let (x, y) = (*x as i64, *y as i64);
                format!("input swipe {x} {y} {x} {y} 600")
            }
            ActionKind::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => format!(
                "input swipe {} {} {} {} {duration_ms}",
                *x1 as i64, *y1 as i64, *x2 as i64, *y2 as i64
            ),
            ActionKind::TypeText { text } => {
                format!("input text '{}'", text.replace('\'', "\\'").replace(' ', "%s"))
            }
            ActionKind::KeyEvent { keycode } => format!("input keyevent {keycode}"),
            ActionKind::OpenApp { package } => format!(
                "monkey -p {package} -c android.intent.category.LAUNCHER 1"
            ),
            ActionKind::Back => "input keyevent KEYCODE_BACK".to_string(),
            ActionKind::Home => "input keyevent KEYCODE_HOME".to_string(),
            ActionKind::Wait { ms } => {
                std::thread::sleep(Duration::from_millis((*ms).min(deadline.remaining().as_millis() as u64)));
                return Ok(InputReceipt {
                    success: true,
                    timestamp_ms: host_utc_ms(),
                });
            }
        };
        let out = self.run_shell(&cmd, deadline)?;
        Ok(InputReceipt {
            success: out.ok(),
            timestamp_ms: host_utc_ms(),
        })
    }

    fn run_shell(&mut self, cmd: &str, deadline: Deadline) -> HarnessResult<ShellOutput> {
        let (stdout, stderr, exit_code) = self.run(&["shell", cmd], deadline)?;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    fn pull(&mut self, path: &str, deadline: Deadline) -> HarnessResult<Vec<u8>> {
        // `exec-out cat` is binary-safe and avoids host temp files.
        let (stdout, _, code) = self.run(&["exec-out", "cat", path], deadline)?;
        if code != 0 {
            return Err(HarnessError::Infra(format!("pull failed: {path}")));
        }
        Ok(stdout)
    }

    fn reset(&mut self, snapshot: Option<&str>, deadline: Deadline) -> HarnessResult<()> {
        if let Some(snapshot) = snapshot {
            let (_, stderr, code) = self.run(
                &["emu", "avd", "snapshot", "load", snapshot],
                deadline.sub_deadline(60_000),
            )?;
            if code != 0 {
                return Err(HarnessError::Infra(format!(
                    "snapshot load failed: {}",
                    String::from_utf8_lossy(&stderr).trim()
                )));
            }
        }
        let (_, _, code) = self.run(&["wait-for-device"], deadline)?;
        if code != 0 {
            return Err(HarnessError::Infra("wait-for-device failed".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wm_size_parses_physical_line() {
        let out = "Physical size: 1080x2400\nOverride size: 1080x2400\n";
        assert_eq!(parse_wm_size(out), Some(SizePx { w: 1080, h: 2400 }));
        assert_eq!(parse_wm_size("garbage"), None);
    }
}
