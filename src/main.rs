use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use sshdeck::connection;
use sshdeck::logging;
use sshdeck::preferences::{self, Preferences};
use sshdeck::ssh_config::include::expand_tilde;
use sshdeck::ssh_config::{ConnectableHostEntry, Mutation, NewHost};
use sshdeck::{ConfigEngine, EngineOptions};

#[derive(Parser)]
#[command(
    name = "sshdeck",
    about = "Browse, resolve and edit the hosts in your SSH config.",
    long_about = "sshdeck reads your OpenSSH client config, including every Include,\n\
                  lists the hosts you can actually connect to, shows what ssh will\n\
                  really use for each one, and edits the file without touching\n\
                  anything else in it.",
    version
)]
struct Cli {
    /// Connect to a host by nickname or alias
    #[arg(value_name = "HOST")]
    host: Option<String>,

    /// Path to SSH config file [default: ~/.ssh/config]
    #[arg(long, global = true)]
    config: Option<String>,

    /// More logging (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL")]
    completions: Option<Shell>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List connectable hosts
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List pattern rules and Match blocks
    Rules,
    /// Report problems found while reading the config
    Check,
    /// List every file read, includes included
    Files,
    /// Show the settings ssh will actually use for a host
    Show {
        host: String,

        /// Print JSON instead of `keyword value` lines
        #[arg(long)]
        json: bool,
    },
    /// Open an SSH session to a host
    Connect { host: String },
    /// Add a host: sshdeck add web1 --hostname 10.0.0.1 --user deploy
    Add {
        nickname: String,

        #[arg(long)]
        hostname: String,

        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Extra name for the same host (repeatable)
        #[arg(short, long = "alias")]
        aliases: Vec<String>,

        /// Path to identity file (SSH key)
        #[arg(short = 'i', long)]
        identity_file: Option<String>,

        #[arg(short = 'J', long)]
        proxy_jump: Option<String>,

        #[arg(long)]
        proxy_command: Option<String>,

        /// Any other directive as KEY=VALUE (repeatable)
        #[arg(short, long = "option", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        options: Vec<(String, String)>,

        /// Loaded config file to add the host to [default: the root config]
        #[arg(long)]
        file: Option<String>,
    },
    /// Rename a host
    Rename { host: String, new_name: String },
    /// Replace the aliases of a host (none given clears them)
    Aliases { host: String, aliases: Vec<String> },
    /// Set a directive on a host
    Set {
        host: String,
        keyword: String,
        value: String,
    },
    /// Remove a directive from a host
    Unset { host: String, keyword: String },
    /// Delete a host and the comments directly above it
    Delete { host: String },
    /// Show preferences, or set one
    Prefs {
        key: Option<String>,
        value: Option<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn resolve_config_path(cli_path: Option<&str>, prefs: &Preferences) -> Result<PathBuf> {
    match cli_path {
        Some(path) => Ok(PathBuf::from(expand_tilde(path))),
        None => prefs
            .config_path()
            .context("Could not determine home directory"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Shell completions (no config file needed)
    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "sshdeck", &mut std::io::stdout());
        return Ok(());
    }

    logging::init(cli.verbose);
    let prefs = Preferences::load();

    if let Some(Commands::Prefs { key, value }) = &cli.command {
        return handle_prefs(&prefs, key.as_deref(), value.as_deref());
    }

    let config_path = resolve_config_path(cli.config.as_deref(), &prefs)?;
    let mut engine = ConfigEngine::open(&config_path, &EngineOptions::from(&prefs))
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    if let Some(host) = cli.host {
        return handle_connect(&engine, &host);
    }

    match cli.command {
        None | Some(Commands::List { json: false }) => print_hosts(&engine.list_connectable_hosts()),
        Some(Commands::List { json: true }) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&engine.list_connectable_hosts())?
            );
        }
        Some(Commands::Rules) => handle_rules(&engine),
        Some(Commands::Check) => handle_check(&engine),
        Some(Commands::Files) => handle_files(&engine),
        Some(Commands::Show { host, json }) => return handle_show(&engine, &host, json),
        Some(Commands::Connect { host }) => return handle_connect(&engine, &host),
        Some(Commands::Add {
            nickname,
            hostname,
            user,
            port,
            aliases,
            identity_file,
            proxy_jump,
            proxy_command,
            options,
            file,
        }) => {
            let host = NewHost {
                nickname: nickname.clone(),
                aliases,
                hostname,
                user,
                port,
                identity_file,
                proxy_jump,
                proxy_command,
                extra: options,
            };
            let file = file.map(|f| PathBuf::from(expand_tilde(&f)));
            apply(&mut engine, Mutation::Add { host, file }, &format!("Added {}.", nickname))?;
        }
        Some(Commands::Rename { host, new_name }) => {
            let done = format!("Renamed {} to {}.", host, new_name);
            apply(
                &mut engine,
                Mutation::Rename {
                    nickname: host,
                    new_nickname: new_name,
                },
                &done,
            )?;
        }
        Some(Commands::Aliases { host, aliases }) => {
            let done = format!("Updated aliases of {}.", host);
            apply(
                &mut engine,
                Mutation::SetAliases {
                    nickname: host,
                    aliases,
                },
                &done,
            )?;
        }
        Some(Commands::Set {
            host,
            keyword,
            value,
        }) => {
            let done = format!("Set {} on {}.", keyword, host);
            apply(
                &mut engine,
                Mutation::SetDirective {
                    nickname: host,
                    keyword,
                    value,
                },
                &done,
            )?;
        }
        Some(Commands::Unset { host, keyword }) => {
            let done = format!("Removed {} from {}.", keyword, host);
            apply(
                &mut engine,
                Mutation::UnsetDirective {
                    nickname: host,
                    keyword,
                },
                &done,
            )?;
        }
        Some(Commands::Delete { host }) => {
            let done = format!("Deleted {}.", host);
            apply(&mut engine, Mutation::Delete { nickname: host }, &done)?;
        }
        Some(Commands::Prefs { key, value }) => {
            return handle_prefs(&prefs, key.as_deref(), value.as_deref());
        }
    }

    Ok(())
}

fn apply(engine: &mut ConfigEngine, mutation: Mutation, done: &str) -> Result<()> {
    if engine.apply_edit(&mutation)? {
        println!("{}", done);
    } else {
        println!("Nothing to change.");
    }
    Ok(())
}

fn print_hosts(hosts: &[ConnectableHostEntry]) {
    if hosts.is_empty() {
        println!("No connectable hosts. Add one with 'sshdeck add'.");
        return;
    }
    for host in hosts {
        let user = match &host.user {
            Some(user) => format!("{}@", user),
            None => String::new(),
        };
        let port = match host.port {
            Some(port) if port != 22 => format!(":{}", port),
            _ => String::new(),
        };
        let aliases = if host.aliases.is_empty() {
            String::new()
        } else {
            format!("  ({})", host.aliases.join(", "))
        };
        println!(
            "{:<20} {}{}{}{}",
            host.nickname, user, host.hostname, port, aliases
        );
    }
}

fn handle_rules(engine: &ConfigEngine) {
    let rules = engine.rule_blocks();
    if rules.is_empty() {
        println!("No rules.");
        return;
    }
    for rule in rules {
        println!(
            "{}:{}  {:<18} {}",
            rule.source.display(),
            rule.line,
            rule.reason.label(),
            rule.patterns.join(" ")
        );
    }
}

fn handle_check(engine: &ConfigEngine) {
    let diagnostics = engine.diagnostics();
    if diagnostics.is_empty() {
        println!("No problems found in {} file(s).", engine.files().len());
        return;
    }
    for diagnostic in diagnostics {
        println!("{}", diagnostic);
    }
    std::process::exit(1);
}

fn handle_files(engine: &ConfigEngine) {
    let document = engine.document();
    let all_hosts = engine.list_connectable_hosts();
    for file in document.files() {
        let hosts = all_hosts
            .iter()
            .filter(|h| h.source == file.path)
            .count();
        println!(
            "{}  ({} block(s), {} host(s))",
            file.path.display(),
            file.blocks.len(),
            hosts
        );
    }
    for edge in document.includes() {
        let from = &document.file(edge.from.file).path;
        println!(
            "{}:{}  Include {} -> {} file(s)",
            from.display(),
            edge.line,
            edge.patterns.join(" "),
            edge.files.len()
        );
    }
}

fn handle_show(engine: &ConfigEngine, host: &str, json: bool) -> Result<()> {
    let config = engine.resolve_effective_config(host)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    for (key, values) in config.iter() {
        for value in values {
            println!("{} {}", key, value);
        }
    }
    Ok(())
}

fn handle_connect(engine: &ConfigEngine, host: &str) -> Result<()> {
    let nickname = match engine.find_host(host) {
        Some(entry) => entry.nickname,
        None => {
            tracing::info!("{} is not a connectable host, passing it to ssh as is", host);
            host.to_string()
        }
    };
    println!("Connecting to {}...\n", nickname);
    let status = connection::connect(engine.resolver(), &nickname)?;
    std::process::exit(status.code().unwrap_or(1));
}

fn handle_prefs(prefs: &Preferences, key: Option<&str>, value: Option<&str>) -> Result<()> {
    match (key, value) {
        (None, _) => {
            for (key, value) in prefs.entries() {
                println!("{}={}", key, value);
            }
        }
        (Some(key), None) => match prefs.entries().into_iter().find(|(k, _)| *k == key) {
            Some((_, value)) => println!("{}", value),
            None => bail!("Unknown preference '{}'", key),
        },
        (Some(key), Some(value)) => {
            if let Err(reason) = preferences::validate(key, value) {
                bail!("{}", reason);
            }
            preferences::save_key(key, value).context("Failed to save preferences")?;
            println!("Saved {}={}.", key, value.trim());
        }
    }
    Ok(())
}
