mod backend;
mod coordinator;
mod core;
mod process;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::backend::{BackendDescriptor, BackendRegistry};
use crate::coordinator::{EngineEvent, Intent, Notification, PlaybackCoordinator};
use crate::core::{Settings, Source, KIND_URL};

fn registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(BackendDescriptor {
        name: backend::text::NAME,
        label: "MPlayer",
        supports: &[
            crate::core::KIND_URL,
            crate::core::KIND_DVD,
            crate::core::KIND_VCD,
            crate::core::KIND_TV,
            crate::core::KIND_AUDIOCD,
            crate::core::KIND_PIPE,
        ],
        create: backend::text::TextBackend::create,
    });
    #[cfg(unix)]
    registry.register(BackendDescriptor {
        name: backend::callback::NAME,
        label: "Xine",
        supports: &[
            crate::core::KIND_URL,
            crate::core::KIND_VCD,
            crate::core::KIND_AUDIOCD,
        ],
        create: backend::callback::CallbackBackend::create,
    });
    registry.register(BackendDescriptor {
        name: backend::dump::NAME,
        label: "MPlayer dump",
        supports: &[crate::core::KIND_URL],
        create: backend::dump::DumpBackend::create,
    });
    registry
}

/// Maps one console line to a playback intent.
fn parse_command(line: &str) -> Option<Intent> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    let arg = |w: Option<&str>| w.and_then(|v| v.parse::<i64>().ok());
    match verb {
        "open" => {
            let url = words.next()?;
            Some(Intent::OpenSource(Source::new(KIND_URL, url).shared()))
        }
        "play" => Some(Intent::Play),
        "pause" => Some(Intent::Pause),
        "resume" => Some(Intent::Unpause),
        "stop" => Some(Intent::Stop),
        "seek" => {
            // "seek 120" is absolute deciseconds, "seek +50" skips ahead.
            let raw = words.next()?;
            let relative = raw.starts_with('+');
            let value = raw.trim_start_matches('+').parse::<u64>().ok()?;
            Some(Intent::Seek {
                position: value,
                absolute: !relative,
            })
        }
        "volume" => Some(Intent::Volume {
            value: arg(words.next())? as i32,
            absolute: true,
        }),
        "saturation" => Some(Intent::Saturation {
            value: arg(words.next())? as i32,
            absolute: true,
        }),
        "hue" => Some(Intent::Hue {
            value: arg(words.next())? as i32,
            absolute: true,
        }),
        "contrast" => Some(Intent::Contrast {
            value: arg(words.next())? as i32,
            absolute: true,
        }),
        "brightness" => Some(Intent::Brightness {
            value: arg(words.next())? as i32,
            absolute: true,
        }),
        "backend" => Some(Intent::ForceBackend {
            kind: words.next()?.to_string(),
            backend: words.next()?.to_string(),
        }),
        "probeconfig" => Some(Intent::ProbeConfig),
        "pushconfig" => {
            let path = words.next()?;
            match std::fs::read_to_string(path) {
                Ok(data) => Some(Intent::PushConfig { data }),
                Err(e) => {
                    log::warn!("cannot read config {}: {}", path, e);
                    None
                }
            }
        }
        "quit" => Some(Intent::Shutdown),
        _ => {
            log::warn!("unknown command: {}", verb);
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: procplay <url>"))?;

    let settings = Settings::load()?.shared();
    let registry = registry();
    for descriptor in registry.iter() {
        log::debug!("backend available: {} ({})", descriptor.name, descriptor.label);
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();

    let coordinator = PlaybackCoordinator::new(settings, registry, events_tx.clone(), notify_tx);

    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            match notification {
                Notification::Console(line) => log::debug!("player: {}", line),
                Notification::Error { code, message } => {
                    log::error!("player error {}: {}", code, message)
                }
                other => log::info!("{:?}", other),
            }
        }
    });

    let console_tx = events_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(intent) = parse_command(&line) {
                if console_tx.send(EngineEvent::Intent(intent)).is_err() {
                    break;
                }
            }
        }
    });

    let ctrl_c_tx = events_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c_tx.send(EngineEvent::Intent(Intent::Stop));
            let _ = ctrl_c_tx.send(EngineEvent::Intent(Intent::Shutdown));
        }
    });

    let source = Source::new(KIND_URL, url).shared();
    let _ = events_tx.send(EngineEvent::Intent(Intent::OpenSource(source)));

    coordinator.run(events_rx).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seek_commands() {
        match parse_command("seek 120") {
            Some(Intent::Seek { position, absolute }) => {
                assert_eq!(position, 120);
                assert!(absolute);
            }
            other => panic!("unexpected intent: {:?}", other),
        }
        match parse_command("seek +50") {
            Some(Intent::Seek { position, absolute }) => {
                assert_eq!(position, 50);
                assert!(!absolute);
            }
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_and_incomplete_commands() {
        assert!(parse_command("florble").is_none());
        assert!(parse_command("backend urlsource").is_none());
        assert!(matches!(
            parse_command("backend urlsource xine"),
            Some(Intent::ForceBackend { .. })
        ));
    }
}
