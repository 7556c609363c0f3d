use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vigil_client::{ClientSession, HttpResolver};
use vigil_core::{
    Credential, CredentialStore, NotificationFilter, PolicyEngine, Principal, Subject, Value,
};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Vigil remote management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the registry HTTP surface
    #[arg(long, global = true, env = "VIGIL_REGISTRY", default_value = "http://127.0.0.1:5801")]
    registry: String,

    /// Registry name of the connector server
    #[arg(long, global = true, default_value = "vigil")]
    service: String,

    #[arg(long, global = true, env = "VIGIL_USER", default_value = "monitorRole")]
    user: String,

    #[arg(long, global = true, env = "VIGIL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Declared origin of this client, matched against origin-scoped grants
    #[arg(long, global = true)]
    origin: Option<String>,

    /// Act on behalf of these principals (`kind:name`, repeatable)
    #[arg(long, global = true)]
    delegate: Vec<Principal>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show registry health and bound services
    Status,
    /// List managed objects matching a pattern
    Objects {
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Read an attribute
    Get { object: String, attribute: String },
    /// Write an attribute; the value is typed from its literal
    Set {
        object: String,
        attribute: String,
        value: String,
    },
    /// Invoke an operation
    Invoke {
        object: String,
        operation: String,
        args: Vec<String>,
    },
    /// Print notifications of an object until interrupted
    Watch {
        object: String,
        /// Notification type prefixes to accept (repeatable)
        #[arg(long)]
        filter: Vec<String>,
        /// Stop after this many notifications
        #[arg(long)]
        count: Option<usize>,
    },
    /// Create an object from a server-side factory
    Register { name: String, kind: String },
    /// Remove an object
    Unregister { name: String },
    /// Validate local configuration files
    Check {
        #[command(subcommand)]
        sub: CheckCommands,
    },
}

#[derive(Subcommand)]
enum CheckCommands {
    /// Parse a password file
    Credentials {
        file: PathBuf,
        /// Report whether this identifier is present
        #[arg(long)]
        identifier: Option<String>,
    },
    /// Parse a policy file
    Policy {
        file: PathBuf,
        /// Show the grants held by this principal
        #[arg(long)]
        principal: Option<Principal>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let resolver = HttpResolver::new(cli.registry.clone());

    match &cli.command {
        Commands::Status => {
            let healthy = resolver.health().await;
            println!("Vigil Registry Status");
            println!("{}", "=".repeat(35));
            println!("Registry:  {} ({})", resolver.base_url(), if healthy { "up" } else { "down" });
            if healthy {
                let bindings = resolver.list().await?;
                println!("{:<20} {:<20} {:<10}", "Service", "Host", "Port");
                println!("{}", "-".repeat(50));
                for binding in bindings {
                    println!("{:<20} {:<20} {:<10}", binding.name, binding.host, binding.port);
                }
            }
        }
        Commands::Check { sub } => match sub {
            CheckCommands::Credentials { file, identifier } => {
                println!("{}", check_credentials(file, identifier.as_deref())?);
            }
            CheckCommands::Policy { file, principal } => {
                println!("{}", check_policy(file, principal.as_ref())?);
            }
        },
        command => {
            let session = connect(&cli, &resolver).await?;
            let result = run_remote(&session, command).await;
            session.close().await?;
            result?;
        }
    }

    Ok(())
}

async fn connect(cli: &Cli, resolver: &HttpResolver) -> Result<ClientSession, Box<dyn std::error::Error>> {
    let password = cli
        .password
        .clone()
        .ok_or("a password is required (--password or VIGIL_PASSWORD)")?;
    let credential = Credential::new(cli.user.clone(), password);
    let session = ClientSession::connect(resolver, &cli.service, credential, cli.origin.clone()).await?;
    if cli.delegate.is_empty() {
        return Ok(session);
    }
    let subject = Subject::new(cli.delegate.iter().cloned())?;
    Ok(session.with_delegate(subject))
}

async fn run_remote(
    session: &ClientSession,
    command: &Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Objects { pattern } => {
            for name in session.list_objects(pattern).await? {
                println!("{name}");
            }
        }
        Commands::Get { object, attribute } => {
            let value = session.get_attribute(object, attribute).await?;
            println!("{attribute} = {value}");
        }
        Commands::Set {
            object,
            attribute,
            value,
        } => {
            let value = Value::infer(value);
            session.set_attribute(object, attribute, value.clone()).await?;
            println!("{attribute} set to {value} ({})", value.type_name());
        }
        Commands::Invoke {
            object,
            operation,
            args,
        } => {
            let args = args.iter().map(|a| Value::infer(a)).collect();
            let result = session.invoke(object, operation, args).await?;
            println!("{operation} returned {result}");
        }
        Commands::Watch {
            object,
            filter,
            count,
        } => {
            let filter = filter
                .iter()
                .fold(NotificationFilter::accept_all(), |f, prefix| f.enable(prefix.as_str()));
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let subscription = session
                .subscribe(object, filter, move |n| {
                    let _ = tx.send(n);
                })
                .await?;
            eprintln!("watching {object} ({subscription}), Ctrl+C to stop");

            let mut seen = 0usize;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    received = rx.recv() => {
                        let Some(n) = received else { break };
                        println!("{}", serde_json::to_string(&n)?);
                        seen += 1;
                        if count.is_some_and(|limit| seen >= limit) {
                            break;
                        }
                    }
                }
            }
            session.unsubscribe(object, subscription).await?;
        }
        Commands::Register { name, kind } => {
            session.register(name, kind).await?;
            println!("Registered {name} ({kind})");
        }
        Commands::Unregister { name } => {
            session.unregister(name).await?;
            println!("Unregistered {name}");
        }
        Commands::Status | Commands::Check { .. } => {}
    }
    Ok(())
}

fn check_credentials(
    file: &Path,
    identifier: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let store = CredentialStore::from_file(file)?;
    let mut report = format!("{}: {} identities", file.display(), store.len());
    if let Some(identifier) = identifier {
        let state = if store.contains(identifier) { "present" } else { "missing" };
        report.push_str(&format!("\n{identifier}: {state}"));
    }
    Ok(report)
}

fn check_policy(
    file: &Path,
    principal: Option<&Principal>,
) -> Result<String, Box<dyn std::error::Error>> {
    let engine = PolicyEngine::from_file(file)?;
    let mut report = format!("{}: {} grants", file.display(), engine.grant_count());
    if let Some(principal) = principal {
        let grants = engine.grants_for(principal);
        if grants.is_empty() {
            report.push_str(&format!("\n{principal}: no grants (everything denied)"));
        }
        for grant in grants {
            let permissions: Vec<String> = grant.permissions.iter().map(ToString::to_string).collect();
            let origin = grant
                .origin
                .as_ref()
                .map(|o| format!(" origin={o}"))
                .unwrap_or_default();
            report.push_str(&format!("\n{principal}{origin}: {}", permissions.join(" ")));
        }
    }
    Ok(report)
}
