use clap::Parser;
use idswap::cli::{Cli, Command};
use idswap::config::Config;
use idswap::engine::{EngineOptions, HostStop, SwitchEngine};
use idswap::logging;
use idswap::process::{LaunchMethod, SystemController};
use idswap::store::{FsSnapshotStore, Snapshot, SnapshotStore};

type Engine = SwitchEngine<FsSnapshotStore, SystemController>;

fn format_time(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn print_table(snapshots: &[Snapshot]) {
    println!("{:<4} {:<10} {:<24} {:<28} {:<17} {:<17}", "#", "ID", "Name", "Account", "Created", "Last used");
    println!("{}", "-".repeat(104));

    for (i, snapshot) in snapshots.iter().enumerate() {
        let position = if snapshot.is_reserved() { "-".to_string() } else { (i + 1).to_string() };
        let short_id: String = snapshot.id.chars().take(8).collect();
        let account = snapshot.account_email.as_deref().unwrap_or("unknown");
        println!(
            "{:<4} {:<10} {:<24} {:<28} {:<17} {:<17}",
            position,
            short_id,
            snapshot.display_name,
            account,
            format_time(Some(snapshot.created_at)),
            format_time(snapshot.last_used_at),
        );
    }
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("error: {e}");
    std::process::exit(1);
}

fn open_engine(config: &Config) -> Engine {
    let store = FsSnapshotStore::open(&config.data_dir, &config.host.state_dir, config.order)
        .unwrap_or_else(|e| fail(e));
    let process = SystemController::for_current_platform(&config.host.name, config.timeouts.poll_interval)
        .with_uri_opener(config.host.uri_opener.clone());
    SwitchEngine::new(store, process, EngineOptions::from_config(config))
}

fn run_startup_backup(engine: &Engine) {
    match engine.startup_backup() {
        Ok(Some(_)) => tracing::info!("startup backup refreshed"),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "startup backup failed"),
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| fail(e));

    match cli.command {
        Command::List(args) => {
            let engine = open_engine(&config);
            let snapshots = engine.list(args.all).unwrap_or_else(|e| fail(e));

            if args.json {
                match serde_json::to_string_pretty(&snapshots) {
                    Ok(json) => println!("{json}"),
                    Err(e) => fail(e),
                }
            } else if snapshots.is_empty() {
                println!("No snapshots yet. Run 'idswap add' to capture the current identity.");
            } else {
                print_table(&snapshots);
            }
        }
        Command::Add(args) => {
            let engine = open_engine(&config);
            let snapshot = engine.add_snapshot(args.label.as_deref()).unwrap_or_else(|e| fail(e));
            println!("saved snapshot {} ({})", snapshot.display_name, snapshot.id);
            if let Some(email) = &snapshot.account_email {
                println!("account: {email}");
            }
        }
        Command::Switch(args) => {
            if args.no_launch {
                config.relaunch = false;
            }
            let engine = open_engine(&config);
            run_startup_backup(&engine);

            match engine.switch_to(&args.snapshot) {
                Ok(report) => {
                    match report.host_stop {
                        HostStop::NotRunning => {}
                        HostStop::Graceful => println!("closed {}", config.host.name),
                        HostStop::Forced => println!("force-closed {}", config.host.name),
                    }
                    if let Some(backup) = &report.pre_switch_backup {
                        println!("previous state saved as '{}'", backup.id);
                    }
                    println!("switched to {}", report.target.display_name);
                    match report.launch.map(|l| l.method) {
                        Some(LaunchMethod::Executable(path)) => println!("started {}", path.display()),
                        Some(LaunchMethod::Uri(uri)) => println!("started via {uri}"),
                        None => println!("{} left stopped", config.host.name),
                    }
                }
                Err(e) => fail(e),
            }
        }
        Command::Delete(args) => {
            let engine = open_engine(&config);
            let snapshot = engine.delete(&args.snapshot).unwrap_or_else(|e| fail(e));
            println!("deleted {} ({})", snapshot.display_name, snapshot.id);
        }
        Command::Backup => {
            let engine = open_engine(&config);
            match engine.startup_backup() {
                Ok(Some(snapshot)) => println!("startup backup refreshed ({})", format_time(Some(snapshot.captured_at))),
                Ok(None) => println!("nothing to back up: {} does not exist or is empty", config.host.state_dir.display()),
                Err(e) => fail(e),
            }
        }
        Command::Status(args) => {
            let engine = open_engine(&config);
            let status = engine.status().unwrap_or_else(|e| fail(e));

            if args.json {
                match serde_json::to_string_pretty(&status) {
                    Ok(json) => println!("{json}"),
                    Err(e) => fail(e),
                }
            } else {
                match &status.host_pids {
                    Some(pids) => println!("{}: running (pids {:?})", config.host.name, pids),
                    None => println!("{}: not running", config.host.name),
                }
                println!("state dir: {}", config.host.state_dir.display());
                println!("account: {}", status.identity.email.as_deref().unwrap_or("unknown"));
                match &status.current {
                    Some(s) => println!("last switched to: {} ({})", s.display_name, format_time(s.last_used_at)),
                    None => println!("last switched to: none"),
                }
            }
        }
        Command::Check(args) => {
            let engine = open_engine(&config);
            let store = engine.store();

            if args.repair {
                let report = store.repair().unwrap_or_else(|e| fail(e));
                if report.is_consistent() {
                    println!("index and payloads are consistent");
                } else {
                    println!(
                        "repaired: dropped {} entries without payload, moved {} unindexed payloads to orphans/",
                        report.missing_payloads.len(),
                        report.orphan_payloads.len()
                    );
                }
            } else {
                let report = store.check().unwrap_or_else(|e| fail(e));
                match report.into_result() {
                    Ok(()) => println!("index and payloads are consistent"),
                    Err(e) => fail(e),
                }
            }
        }
    }
}
