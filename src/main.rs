use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use fleetbench::campaign::{Campaign, CampaignTemplate};
use fleetbench::config::OrchestratorConfig;
use fleetbench::fleet::{FailurePolicy, Fleet, FleetResult, RemoteCommand};
use fleetbench::inventory::{self, Host, HostStatus, Inventory};
use fleetbench::progress::TracingProgressBar;
use fleetbench::report;
use std::time::Duration;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:?}", e);
            std::process::exit(2);
        }
    }
}

async fn run() -> Result<i32, Report> {
    color_eyre::install()?;

    let matches = App::new("fleetbench")
        .version("0.1")
        .about("Fleet orchestration and benchmark-campaign controller")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("orchestrator configuration (JSON); defaults are used when not set")
                .takes_value(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("inventory")
                .about("Discovers and classifies remote hosts")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("list")
                        .about("Lists running hosts from the cloud provider")
                        .arg(
                            Arg::with_name("role")
                                .long("role")
                                .value_name("R")
                                .help("keep only hosts whose name contains this substring")
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("replicas-file")
                                .long("replicas-file")
                                .value_name("FILE")
                                .help("also write the replica address-pair listing here")
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("clients-file")
                                .long("clients-file")
                                .value_name("FILE")
                                .help("also write the client address listing here")
                                .takes_value(true),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("fleet")
                .about("Runs a command across a set of remote hosts")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("run")
                        .about("Dispatches a command to every host in parallel")
                        .arg(
                            Arg::with_name("hosts")
                                .long("hosts")
                                .value_name("H1,H2,...")
                                .help("comma-separated host addresses")
                                .required(true)
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("cmd")
                                .long("cmd")
                                .value_name("COMMAND")
                                .help("program and arguments, whitespace-separated")
                                .required(true)
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("policy")
                                .long("policy")
                                .value_name("POLICY")
                                .help("fail_fast or continue; default: continue")
                                .takes_value(true),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("setup")
                        .about("Copies a setup script to every host and runs it")
                        .arg(
                            Arg::with_name("hosts")
                                .long("hosts")
                                .value_name("H1,H2,...")
                                .help("comma-separated host addresses")
                                .required(true)
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("script")
                                .long("script")
                                .value_name("FILE")
                                .help("local script to copy and execute on each host")
                                .required(true)
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("script-args")
                                .long("script-args")
                                .value_name("ARGS")
                                .help("arguments passed to the script, whitespace-separated")
                                .takes_value(true),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("campaign")
                .about("Runs a benchmark sweep")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("run")
                        .about("Runs one benchmark run per sweep value, in order")
                        .arg(
                            Arg::with_name("sweep")
                                .long("sweep")
                                .value_name("V1,V2,...")
                                .help("comma-separated parameter values")
                                .required(true)
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("template")
                                .long("template")
                                .value_name("FILE")
                                .help("campaign template (JSON)")
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("inter-run-delay")
                                .long("inter-run-delay")
                                .value_name("SECONDS")
                                .help("steady-state wait between start and stop; default: 60")
                                .takes_value(true),
                        ),
                ),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };

    match matches.subcommand() {
        ("inventory", Some(matches)) => match matches.subcommand() {
            ("list", Some(matches)) => inventory_list(config, matches).await,
            _ => unreachable!("clap enforces a subcommand"),
        },
        ("fleet", Some(matches)) => match matches.subcommand() {
            ("run", Some(matches)) => fleet_run(config, matches).await,
            ("setup", Some(matches)) => fleet_setup(config, matches).await,
            _ => unreachable!("clap enforces a subcommand"),
        },
        ("campaign", Some(matches)) => match matches.subcommand() {
            ("run", Some(matches)) => campaign_run(config, matches).await,
            _ => unreachable!("clap enforces a subcommand"),
        },
        _ => unreachable!("clap enforces a subcommand"),
    }
}

async fn inventory_list(
    config: OrchestratorConfig,
    matches: &ArgMatches<'_>,
) -> Result<i32, Report> {
    init_tracing();
    let inventory = Inventory::from_config(&config);
    let hosts = inventory.resolve(matches.value_of("role")).await?;

    for host in &hosts {
        println!(
            "{:<24} {:<16} {:<16} {:?}",
            host.name, host.internal_addr, host.external_addr, host.role
        );
    }

    if let Some(path) = matches.value_of("replicas-file") {
        inventory::write_replicas_file(&hosts, path, config.replica_dup_count)
            .wrap_err("write replicas file")?;
    }
    if let Some(path) = matches.value_of("clients-file") {
        inventory::write_clients_file(&hosts, path).wrap_err("write clients file")?;
    }
    Ok(0)
}

async fn fleet_run(config: OrchestratorConfig, matches: &ArgMatches<'_>) -> Result<i32, Report> {
    init_tracing();
    let hosts = parse_hosts(matches.value_of("hosts").expect("hosts is required"));
    let command = parse_command(matches.value_of("cmd").expect("cmd is required"))?;
    let policy = match matches.value_of("policy") {
        Some("fail_fast") => FailurePolicy::FailFast,
        Some("continue") | None => FailurePolicy::WarnAndContinue,
        Some(other) => {
            return Err(Report::msg(format!(
                "unknown policy {} (expected fail_fast or continue)",
                other
            )))
        }
    };

    let fleet = Fleet::from_config(&config);
    let result = fleet.run_on(&hosts, &command, policy).await?;
    Ok(print_outcomes(&result))
}

async fn fleet_setup(config: OrchestratorConfig, matches: &ArgMatches<'_>) -> Result<i32, Report> {
    init_tracing();
    let hosts = parse_hosts(matches.value_of("hosts").expect("hosts is required"));
    let script = matches.value_of("script").expect("script is required");
    let args: Vec<String> = matches
        .value_of("script-args")
        .map(|args| args.split_whitespace().map(String::from).collect())
        .unwrap_or_default();

    let fleet = Fleet::from_config(&config);
    // setup errors on one host usually repeat on all of them
    let result = fleet
        .run_script(&hosts, script, "setup.sh", args, FailurePolicy::FailFast)
        .await?;
    Ok(print_outcomes(&result))
}

fn print_outcomes(result: &FleetResult) -> i32 {
    let mut ok = 0;
    for (host, outcome) in &result.outcomes {
        println!("{:<24} {:?}", host.name, outcome);
        if outcome.is_success() {
            ok += 1;
        }
    }
    if ok == result.outcomes.len() {
        0
    } else if ok > 0 {
        1
    } else {
        2
    }
}

async fn campaign_run(
    config: OrchestratorConfig,
    matches: &ArgMatches<'_>,
) -> Result<i32, Report> {
    let values = parse_sweep(matches.value_of("sweep").expect("sweep is required"))?;
    let template = match matches.value_of("template") {
        Some(path) => CampaignTemplate::load(path)?,
        None => CampaignTemplate::new("bench", "max_async"),
    };
    let inter_run_delay = match matches.value_of("inter-run-delay") {
        Some(seconds) => Duration::from_secs(seconds.parse().wrap_err("inter-run-delay")?),
        None => Duration::from_secs(60),
    };

    // one bar tick per sweep point, with tracing logs printed above it
    let progress = TracingProgressBar::init(values.len() as u64);

    let inventory = Inventory::from_config(&config);
    let replica_hosts = inventory.resolve(Some(&config.replica_keyword)).await?;
    let mut client_hosts = inventory.resolve(Some(&config.client_keyword)).await?;
    if client_hosts.is_empty() {
        // colocated deployments run clients next to the replicas
        tracing::warn!("no client hosts found; colocating clients with replicas");
        client_hosts = replica_hosts.clone();
    }

    let mut campaign = Campaign::new(config, template).with_progress(progress);
    let abort = campaign.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("abort requested; finishing the in-flight run");
            abort.abort();
        }
    });

    let result = campaign
        .run_sweep(&values, replica_hosts, client_hosts, inter_run_delay)
        .await?;

    for point in &result.points {
        println!(
            "{:<12} {:>8} {:?}",
            point.run_id, point.value, point.status
        );
    }
    for (value, metrics) in report::summarize(&result) {
        println!(
            "value = {:<8} peak throughput = {:<10} latency = {}ms",
            value, metrics.peak_throughput, metrics.latency_ms
        );
    }
    Ok(result.exit_code())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn parse_hosts(hosts: &str) -> Vec<Host> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(|address| Host {
            name: address.to_string(),
            internal_addr: address.to_string(),
            external_addr: address.to_string(),
            status: HostStatus::Unknown,
            role: None,
        })
        .collect()
}

fn parse_command(cmd: &str) -> Result<RemoteCommand, Report> {
    let mut tokens = cmd.split_whitespace();
    let program = tokens
        .next()
        .ok_or_else(|| Report::msg("empty command"))?;
    Ok(RemoteCommand::new(program).args(tokens))
}

fn parse_sweep(sweep: &str) -> Result<Vec<u64>, Report> {
    sweep
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<u64>()
                .wrap_err_with(|| format!("invalid sweep value: {}", value))
        })
        .collect()
}
