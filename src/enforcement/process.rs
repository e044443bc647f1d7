use std::sync::Mutex;

use anyhow::Result;
use log::info;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::platform::AppIdentity;

pub trait ProcessTerminator: Send + Sync {
    /// Ask the process behind `app` to exit. Returns how many processes were
    /// signalled.
    fn terminate(&self, app: &AppIdentity) -> Result<usize>;
}

pub struct SysinfoTerminator {
    system: Mutex<System>,
    own_pid: u32,
}

impl SysinfoTerminator {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            own_pid: std::process::id(),
        }
    }
}

impl Default for SysinfoTerminator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTerminator for SysinfoTerminator {
    fn terminate(&self, app: &AppIdentity) -> Result<usize> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(pid) = app.pid.filter(|pid| *pid != self.own_pid) {
            let pid = Pid::from_u32(pid);
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
            if let Some(process) = system.process(pid) {
                let killed = usize::from(process.kill());
                info!("Terminated {} (pid {})", app.bundle_id, pid.as_u32());
                return Ok(killed);
            }
        }

        // No usable pid: fall back to a name match on the identifier.
        system.refresh_processes_specifics(ProcessesToUpdate::All, ProcessRefreshKind::new());
        let needle = app.bundle_id.to_lowercase();
        let mut killed = 0;
        for (pid, process) in system.processes() {
            if pid.as_u32() == self.own_pid {
                continue;
            }
            let name = process.name().to_string_lossy().to_lowercase();
            if name == needle && process.kill() {
                killed += 1;
            }
        }
        if killed > 0 {
            info!("Terminated {killed} process(es) named {}", app.bundle_id);
        }
        Ok(killed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records terminate calls instead of killing anything.
    #[derive(Default)]
    pub struct RecordingTerminator {
        pub calls: Mutex<Vec<String>>,
    }

    impl ProcessTerminator for RecordingTerminator {
        fn terminate(&self, app: &AppIdentity) -> Result<usize> {
            self.calls
                .lock()
                .expect("lock")
                .push(app.bundle_id.clone());
            Ok(1)
        }
    }

    #[test]
    fn never_targets_its_own_process() {
        let terminator = SysinfoTerminator::new();
        let me = AppIdentity::new("self", "definitely-not-a-real-process-name")
            .with_pid(std::process::id());
        assert_eq!(terminator.terminate(&me).expect("terminate"), 0);
    }
}
