use anyhow::{Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::screensaver;
use x11rb::protocol::xproto::{Atom, AtomEnum, ConnectionExt, Window};
use x11rb::rust_connection::RustConnection;

use super::{AppIdentity, ForegroundProbe};

/// X11 probe: `_NET_ACTIVE_WINDOW` for the frontmost window, `WM_CLASS` for
/// its identity, `_NET_WM_PID` for the owning process and the
/// MIT-SCREEN-SAVER extension for idle time.
pub struct LinuxProbe {
    conn: RustConnection,
    root: Window,
    active_window: Atom,
    wm_pid: Atom,
}

impl LinuxProbe {
    pub fn connect() -> Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).context("failed to connect to X server")?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .context("X server reported no screens")?;
        let active_window = intern(&conn, "_NET_ACTIVE_WINDOW")?;
        let wm_pid = intern(&conn, "_NET_WM_PID")?;

        Ok(Self {
            conn,
            root,
            active_window,
            wm_pid,
        })
    }

    fn active_window_id(&self) -> Option<Window> {
        let reply = self
            .conn
            .get_property(false, self.root, self.active_window, AtomEnum::WINDOW, 0, 1)
            .ok()?
            .reply()
            .ok()?;
        let window = reply.value32()?.next()?;
        (window != 0).then_some(window)
    }

    fn wm_class(&self, window: Window) -> Option<(String, String)> {
        let reply = self
            .conn
            .get_property(false, window, AtomEnum::WM_CLASS, AtomEnum::STRING, 0, 1024)
            .ok()?
            .reply()
            .ok()?;
        if reply.value.is_empty() {
            return None;
        }
        let raw = String::from_utf8_lossy(&reply.value).into_owned();
        let mut parts = raw.split('\0').filter(|part| !part.is_empty());
        let instance = parts.next()?.to_string();
        let class = parts.next().map(str::to_string).unwrap_or_else(|| instance.clone());
        Some((instance, class))
    }

    fn window_pid(&self, window: Window) -> Option<u32> {
        let reply = self
            .conn
            .get_property(false, window, self.wm_pid, AtomEnum::CARDINAL, 0, 1)
            .ok()?
            .reply()
            .ok()?;
        let pid = reply.value32()?.next();
        pid
    }
}

fn intern(conn: &RustConnection, name: &str) -> Result<Atom> {
    Ok(conn
        .intern_atom(false, name.as_bytes())
        .with_context(|| format!("failed to intern {name}"))?
        .reply()
        .with_context(|| format!("no reply interning {name}"))?
        .atom)
}

impl ForegroundProbe for LinuxProbe {
    fn frontmost_app(&self) -> Option<AppIdentity> {
        let window = self.active_window_id()?;
        let (instance, class) = self.wm_class(window)?;
        Some(AppIdentity {
            name: class,
            bundle_id: instance,
            pid: self.window_pid(window),
        })
    }

    fn idle_seconds(&self) -> Option<u64> {
        let info = screensaver::query_info(&self.conn, self.root)
            .ok()?
            .reply()
            .ok()?;
        Some(u64::from(info.ms_since_user_input / 1000))
    }
}
