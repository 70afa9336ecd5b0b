use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use dock_deck::{
    ctrlc_init, ctrlc_issued_reset, default_config_path, find_dockerfile, python_dockerfile,
    write_dockerfile, Action, ArgError, Canceller, CommandResult, Config, ConfigError, Deck,
    Delta, Engine, ImageRef, OsExecutor, PollEvent, Record, RecordId, StatusEvent, StatusLine,
    DEFAULT_POLL_PERIOD,
};
use stacked_errors::{bail, Result, StackableErr};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Builds, runs, and inspects images and containers through a container engine
/// CLI
#[derive(Parser, Debug)]
#[command(name = "dock_deck", about)]
struct Args {
    /// The JSON configuration file, "config.json" in the working directory if
    /// not given
    #[arg(long, global = true, env = "DOCK_DECK_CONFIG")]
    config: Option<PathBuf>,
    /// The engine program
    #[arg(long, global = true, env = "DOCK_DECK_ENGINE", default_value = "docker")]
    engine: String,
    /// Kills action commands that take longer than this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    /// Also writes a daily rolling log file into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    verb: Verb,
}

#[derive(clap::Args, Debug)]
struct ImageArgs {
    /// Image name, `image_name` from the config if not given
    #[arg(long)]
    image: Option<String>,
    /// Tag, `tag_name` from the config or "latest" if not given
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Verb {
    /// Builds an image from a context directory containing a Dockerfile
    Build {
        #[command(flatten)]
        image: ImageArgs,
        #[arg(default_value = ".")]
        context: PathBuf,
    },
    /// Runs a detached container
    Run {
        #[command(flatten)]
        image: ImageArgs,
        /// Container name, `container_name` from the config if not given
        #[arg(long)]
        name: Option<String>,
        /// `[IP:]HOST:CONTAINER[/PROTO]`, `port_mapping` from the config if not
        /// given
        #[arg(long, short)]
        ports: Option<String>,
    },
    Push {
        #[command(flatten)]
        image: ImageArgs,
    },
    Pull {
        #[command(flatten)]
        image: ImageArgs,
    },
    Stop {
        container: Option<String>,
    },
    /// Commits a container to a new image
    Commit {
        container: Option<String>,
        #[command(flatten)]
        image: ImageArgs,
    },
    /// Forcibly removes an image
    Rmi {
        id: String,
    },
    Search {
        term: String,
    },
    Logs {
        container: Option<String>,
    },
    /// Lists images
    Images,
    /// Lists containers, including stopped ones
    Containers,
    /// Polls the inventory and prints changes until ctrl-c
    Watch {
        /// Seconds between refreshes
        #[arg(
            long,
            default_value_t = DEFAULT_POLL_PERIOD.as_secs(),
            value_parser = clap::value_parser!(u64).range(1..),
        )]
        period: u64,
    },
    /// Writes a starting point Python Dockerfile
    Dockerfile {
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// Registry prefix for the base image, `registry` from the config if
        /// not given
        #[arg(long)]
        registry: Option<String>,
        /// `python_version` from the config if not given
        #[arg(long)]
        python_version: Option<String>,
        /// Prints the Dockerfile instead of writing it
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_dir.as_deref())?;
    let config = load_config(args.config.as_deref()).await?;

    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<StatusLine>();
    let (poll_tx, poll_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(line) = status_rx.recv().await {
            println!("{}", line.colored());
        }
    });
    let deck = Deck::new(Engine::new(&args.engine), OsExecutor, status_tx, poll_tx)
        .command_timeout(args.timeout.map(Duration::from_secs));

    let res = run_verb(args.verb, &config, &deck, poll_rx).await;
    // the printer ends once every sender is gone
    drop(deck);
    printer.await.stack()?;
    res
}

fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // status lines go to stdout, so logs go to stderr
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);
    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return Ok(None)
    };
    std::fs::create_dir_all(log_dir)
        .stack_err_with(|| format!("init_logging -> could not create {log_dir:?}"))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "dock_deck.log"));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

/// An explicitly given config file must exist, the default one is optional
async fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).await.stack(),
        None => match Config::load(default_config_path()).await {
            Ok(config) => Ok(config),
            Err(ConfigError::Missing(path)) => {
                debug!("no configuration at {path:?}, using command line values only");
                Ok(Config::default())
            }
            Err(e) => Err(e).stack(),
        },
    }
}

fn image_ref(config: &Config, args: &ImageArgs) -> Result<ImageRef> {
    config
        .image(args.image.as_deref(), args.tag.as_deref())
        .stack()
}

async fn run_verb(
    verb: Verb,
    config: &Config,
    deck: &Deck<OsExecutor>,
    poll_rx: mpsc::UnboundedReceiver<PollEvent>,
) -> Result<()> {
    let action = match verb {
        Verb::Build { image, context } => {
            find_dockerfile(&context).await?;
            Action::Build {
                image: image_ref(config, &image)?,
                context,
            }
        }
        Verb::Run { image, name, ports } => Action::Run {
            image: image_ref(config, &image)?,
            container: config.container(name.as_deref()).stack()?,
            ports: config.ports(ports.as_deref()).stack()?,
        },
        Verb::Push { image } => Action::Push {
            image: image_ref(config, &image)?,
        },
        Verb::Pull { image } => Action::Pull {
            image: image_ref(config, &image)?,
        },
        Verb::Stop { container } => Action::Stop {
            container: config.container(container.as_deref()).stack()?,
        },
        Verb::Commit { container, image } => Action::Commit {
            container: config.container(container.as_deref()).stack()?,
            image: image_ref(config, &image)?,
        },
        Verb::Rmi { id } => Action::RemoveImage { id },
        Verb::Search { term } => Action::Search { term },
        Verb::Logs { container } => Action::Logs {
            container: config.container(container.as_deref()).stack()?,
        },
        Verb::Images => return list(deck, true).await,
        Verb::Containers => return list(deck, false).await,
        Verb::Watch { period } => return watch(deck, Duration::from_secs(period), poll_rx).await,
        Verb::Dockerfile {
            dir,
            registry,
            python_version,
            print,
        } => {
            let registry = registry
                .or_else(|| config.registry.clone())
                .unwrap_or_default();
            let python_version = python_version
                .or_else(|| config.python_version.clone())
                .ok_or(ArgError::Empty("python version"))
                .stack()?;
            let contents = python_dockerfile(&registry, &python_version);
            if print {
                print!("{contents}");
            } else {
                let path = write_dockerfile(&dir, &contents).await.stack()?;
                deck.reporter()
                    .publish(StatusEvent::Info(format!("wrote {}", path.display())));
            }
            return Ok(())
        }
    };
    if !deck.engine_available().await {
        bail!("the engine `{}` is not available", deck.engine().program)
    }
    let shows_output = matches!(action, Action::Search { .. } | Action::Logs { .. });
    let task = action.task_name();
    let result: CommandResult = deck.perform(action).await;
    if shows_output {
        print!("{}", result.stdout());
    }
    if !result.successful() {
        bail!("{task} failed")
    }
    Ok(())
}

async fn list(deck: &Deck<OsExecutor>, images: bool) -> Result<()> {
    let (snapshot, _) = deck.poller().tick().await;
    if let Some(reason) = deck.poller().failure().await {
        bail!("could not list the inventory: {reason}")
    }
    if images {
        for image in snapshot.images.values() {
            println!(
                "{}:{}\t{}\t{}",
                image.repository, image.tag, image.id, image.size
            );
        }
    } else {
        for container in snapshot.containers.values() {
            println!(
                "{}\t{}\t{}\t{}\t{}",
                container.id, container.name, container.image, container.status, container.ports
            );
        }
    }
    Ok(())
}

async fn watch(
    deck: &Deck<OsExecutor>,
    period: Duration,
    mut poll_rx: mpsc::UnboundedReceiver<PollEvent>,
) -> Result<()> {
    ctrlc_init()?;
    let canceller = Canceller::new();
    let handles: [JoinHandle<()>; 2] = [
        Arc::clone(deck.poller()).spawn(period, canceller.token()),
        deck.spawn_timeout_watch(Duration::from_secs(1), canceller.token()),
    ];
    info!("watching `{}` every {period:?}, ctrl-c to stop", deck.engine().program);
    loop {
        tokio::select! {
            event = poll_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    PollEvent::Updated(deltas) => {
                        for delta in &deltas {
                            println!("{}", describe(delta));
                        }
                    }
                    PollEvent::Failed(reason) => {
                        deck.reporter().publish(StatusEvent::PollFailed(reason));
                    }
                    PollEvent::Recovered => {
                        deck.reporter().publish(StatusEvent::PollRecovered);
                    }
                }
            }
            _ = sleep(Duration::from_millis(100)) => {
                if ctrlc_issued_reset() {
                    break
                }
            }
        }
    }
    canceller.cancel();
    for handle in handles {
        handle.await.stack()?;
    }
    Ok(())
}

fn describe(delta: &Delta) -> String {
    match delta {
        Delta::Added(Record::Image(i)) => format!("+ image {}:{} ({})", i.repository, i.tag, i.id),
        Delta::Added(Record::Container(c)) => {
            format!("+ container {} ({}) {}", c.name, c.id, c.status)
        }
        Delta::Removed(RecordId::Image(id)) => format!("- image {id}"),
        Delta::Removed(RecordId::Container(id)) => format!("- container {id}"),
        Delta::Changed(_, Record::Image(i)) => {
            format!("~ image {}:{} ({})", i.repository, i.tag, i.id)
        }
        Delta::Changed(_, Record::Container(c)) => {
            format!("~ container {} ({}) {}", c.name, c.id, c.status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deck() -> (Deck<OsExecutor>, mpsc::UnboundedReceiver<PollEvent>) {
        let (status_tx, _) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        (
            Deck::new(
                Engine::new("dock-deck-no-such-engine-3f9a"),
                OsExecutor,
                status_tx,
                poll_tx,
            ),
            poll_rx,
        )
    }

    #[test]
    fn zero_watch_period_is_rejected() {
        assert!(Args::try_parse_from(["dock_deck", "watch", "--period", "0"]).is_err());
        let args = Args::try_parse_from(["dock_deck", "watch", "--period", "2"]).unwrap();
        assert!(matches!(args.verb, Verb::Watch { period: 2 }));
    }

    #[tokio::test]
    async fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(load_config(Some(&path)).await.is_err());
        std::fs::write(&path, r#"{"image_name": "myapp", "container_name": "web"}"#).unwrap();
        let config = load_config(Some(&path)).await.unwrap();
        assert_eq!(config.image_name.as_deref(), Some("myapp"));
    }

    #[tokio::test]
    async fn arguments_are_checked_before_the_engine() {
        let (deck, poll_rx) = deck();
        // no image name anywhere
        let verb = Verb::Push {
            image: ImageArgs {
                image: None,
                tag: None,
            },
        };
        let err = run_verb(verb, &Config::default(), &deck, poll_rx)
            .await
            .unwrap_err();
        assert!(format!("{err:?}").contains("image name"), "{err:?}");

        // build contexts need a Dockerfile
        let (deck, poll_rx) = self::deck();
        let dir = tempfile::tempdir().unwrap();
        let verb = Verb::Build {
            image: ImageArgs {
                image: Some("myapp".to_owned()),
                tag: None,
            },
            context: dir.path().to_owned(),
        };
        let err = run_verb(verb, &Config::default(), &deck, poll_rx)
            .await
            .unwrap_err();
        assert!(format!("{err:?}").contains("Dockerfile"), "{err:?}");
    }

    #[tokio::test]
    async fn listing_failure_shows_the_reason() {
        let (deck, poll_rx) = deck();
        let err = run_verb(Verb::Images, &Config::default(), &deck, poll_rx)
            .await
            .unwrap_err();
        let err = format!("{err:?}");
        assert!(err.contains("could not list the inventory"), "{err}");
        assert!(err.contains("could not spawn process"), "{err}");
    }

    #[tokio::test]
    async fn dockerfile_verb_writes_the_template() {
        let (deck, poll_rx) = deck();
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            registry: Some("docker.io/library".to_owned()),
            python_version: Some("3.12".to_owned()),
            ..Default::default()
        };
        let verb = Verb::Dockerfile {
            dir: dir.path().to_owned(),
            registry: None,
            python_version: None,
            print: false,
        };
        run_verb(verb, &config, &deck, poll_rx).await.unwrap();
        let contents = std::fs::read_to_string(dir.path().join("Dockerfile")).unwrap();
        assert!(contents.starts_with("FROM docker.io/library/python:3.12\n"));
    }
}
