use anyhow::{bail, Context, Result};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use tether_lib::{
    bootstrap,
    db::BlockMode,
    session::{SessionNotification, SessionPhase, SessionSnapshot},
    settings::SettingsStore,
    sync::SyncRequest,
    utils::init_logging,
    AppState, Services,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Start,
    Pause,
    Resume,
    Stop,
    Dismiss,
    Status,
    Exempt(String),
    Override,
    DismissOverlay,
    Sleep,
    Wake,
    Background,
    Active,
    BlockApp(String, BlockMode),
    BlockDomain(String, BlockMode),
    Blocklist,
    Unblock(String),
    Sync,
    Help,
    Quit,
}

fn parse_mode(raw: Option<&str>) -> Result<BlockMode> {
    match raw {
        None => Ok(BlockMode::HardBlock),
        Some(mode) => BlockMode::parse(mode),
    }
}

fn parse_command(line: &str) -> Result<Option<ReplCommand>> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    let command = match head {
        "start" => ReplCommand::Start,
        "pause" => ReplCommand::Pause,
        "resume" => ReplCommand::Resume,
        "stop" => ReplCommand::Stop,
        "dismiss" => ReplCommand::Dismiss,
        "status" => ReplCommand::Status,
        "exempt" => ReplCommand::Exempt(arg.context("usage: exempt <bundle-id>")?.to_string()),
        "override" => ReplCommand::Override,
        "dismiss-overlay" => ReplCommand::DismissOverlay,
        "sleep" => ReplCommand::Sleep,
        "wake" => ReplCommand::Wake,
        "background" => ReplCommand::Background,
        "active" => ReplCommand::Active,
        "block-app" => {
            let id = arg.context("usage: block-app <bundle-id> [soft-warn|hard-block|timed-lock]")?;
            ReplCommand::BlockApp(id.to_string(), parse_mode(words.next())?)
        }
        "block-domain" => {
            let domain = arg.context("usage: block-domain <domain> [mode]")?;
            ReplCommand::BlockDomain(domain.to_string(), parse_mode(words.next())?)
        }
        "blocklist" => ReplCommand::Blocklist,
        "unblock" => ReplCommand::Unblock(arg.context("usage: unblock <item-id>")?.to_string()),
        "sync" => ReplCommand::Sync,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        other => bail!("unknown command '{other}' (try 'help')"),
    };
    Ok(Some(command))
}

const HELP: &str = "\
commands:
  start | pause | resume | stop | dismiss | status
  exempt <bundle-id>           stop tracking an app for this session
  override | dismiss-overlay   answer the block overlay
  sleep | wake                 simulate system sleep and wake
  background | active          coarse foreground signals
  block-app <id> [mode]        mode: soft-warn, hard-block (default), timed-lock
  block-domain <domain> [mode]
  blocklist | unblock <item-id>
  sync                         full reconciliation now
  quit";

fn print_snapshot(snapshot: &SessionSnapshot) {
    let phase = match snapshot.phase {
        SessionPhase::Idle => "idle",
        SessionPhase::Running => "running",
        SessionPhase::Paused => "paused",
        SessionPhase::Summary => "summary",
    };
    println!(
        "{phase}: {}s elapsed, {}s focused, {} distraction(s){}",
        snapshot.elapsed_seconds,
        snapshot.focused_seconds,
        snapshot.distraction_count,
        snapshot
            .distracted_app
            .as_ref()
            .map(|app| format!(", now in {app}"))
            .unwrap_or_default()
    );
}

async fn execute(state: &AppState, command: ReplCommand) -> Result<bool> {
    let session = &state.session;
    let snapshot = match command {
        ReplCommand::Start => session.start().await?,
        ReplCommand::Pause => session.pause().await?,
        ReplCommand::Resume => session.resume().await?,
        ReplCommand::Stop => {
            let snapshot = session.stop().await?;
            if let Some(finished) = &snapshot.summary {
                println!("{}", state.summary.summarize(finished).await);
            }
            snapshot
        }
        ReplCommand::Dismiss => session.dismiss_summary().await?,
        ReplCommand::Status => session.status().await?,
        ReplCommand::Exempt(id) => session.add_exemption(id).await?,
        ReplCommand::Override => session.override_block().await?,
        ReplCommand::DismissOverlay => session.dismiss_block_overlay().await?,
        ReplCommand::Sleep => session.system_will_sleep().await?,
        ReplCommand::Wake => session.system_did_wake().await?,
        ReplCommand::Background => session.scene_did_enter_background().await?,
        ReplCommand::Active => session.scene_did_become_active().await?,
        ReplCommand::BlockApp(id, mode) => {
            let item = state.policy.block_process(&id, "", mode).await?;
            println!("blocked app {} ({}) as {}", item.display_name, item.id, mode.as_str());
            return Ok(true);
        }
        ReplCommand::BlockDomain(domain, mode) => {
            let item = state.policy.block_domain(&domain, "", mode).await?;
            println!("blocked domain {} ({})", item.display_name, item.id);
            return Ok(true);
        }
        ReplCommand::Blocklist => {
            for item in state.policy.list().await? {
                println!(
                    "{} {} {} {}",
                    item.id,
                    item.display_name,
                    item.mode.as_str(),
                    if item.enabled { "enabled" } else { "disabled" }
                );
            }
            return Ok(true);
        }
        ReplCommand::Unblock(id) => {
            state.policy.remove(&id).await?;
            return Ok(true);
        }
        ReplCommand::Sync => {
            state.sync.request(SyncRequest::Full);
            return Ok(true);
        }
        ReplCommand::Help => {
            println!("{HELP}");
            return Ok(true);
        }
        ReplCommand::Quit => return Ok(false),
    };
    print_snapshot(&snapshot);
    Ok(true)
}

fn spawn_notification_printer(state: &AppState) {
    let mut notifications = state.session.notifications();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            match notification {
                SessionNotification::Recovered { session } => println!(
                    "recovered interrupted session {} ({}s)",
                    session.id, session.duration_seconds
                ),
                SessionNotification::Blocked { app_name, mode } => {
                    println!("blocked {app_name} ({})", mode.as_str())
                }
                SessionNotification::Distraction {
                    app_name,
                    duration_seconds,
                } => println!("distraction: {app_name} for {duration_seconds}s"),
                _ => {}
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    info!("Tether starting up...");

    let store = SettingsStore::open_default()?;
    let settings = store.effective();
    let state = bootstrap(settings, Services::native()).await?;
    spawn_notification_printer(&state);

    let recovered = state.session.snapshot();
    if recovered.phase == SessionPhase::Summary {
        print_snapshot(&recovered);
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(command)) => match execute(&state, command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(err) => error!("{err:#}"),
                    },
                    Err(err) => println!("{err}"),
                }
            }
        }
    }

    state.shutdown().await;
    Ok(())
}
