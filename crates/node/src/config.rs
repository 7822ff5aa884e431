//! Command line and `stakd.conf` handling. Flags given on the command line
//! win over the conf file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use stakd_consensus::money::{Amount, COIN};
use stakd_consensus::Network;
use stakd_log as logging;

use crate::staker::DEFAULT_STAKE_INTERVAL_MS;

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    pub conf_path: PathBuf,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub staking: bool,
    pub stake_interval_ms: u64,
    pub reserve_balance: Amount,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut log_timestamps_set = false;
    let mut staking = true;
    let mut staking_set = false;
    let mut stake_interval_ms = DEFAULT_STAKE_INTERVAL_MS;
    let mut stake_interval_set = false;
    let mut reserve_balance: Amount = 0;
    let mut reserve_balance_set = false;

    let mut args = raw_args.into_iter().peekable();
    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                conf_path = Some(PathBuf::from(value));
            }
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = Network::parse(&value).ok_or_else(|| {
                    format!(
                        "invalid network '{value}' (expected mainnet|testnet|regtest)\n{}",
                        usage()
                    )
                })?;
                network_set = true;
            }
            "--log-level" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => {
                log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
                log_timestamps_set = true;
            }
            "--staking" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --staking\n{}", usage()))?;
                staking = parse_conf_bool(&value)
                    .ok_or_else(|| format!("invalid staking value '{value}'\n{}", usage()))?;
                staking_set = true;
            }
            "--stake-interval-ms" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --stake-interval-ms\n{}", usage())
                })?;
                stake_interval_ms = parse_interval(&value)
                    .ok_or_else(|| format!("invalid stake interval '{value}'\n{}", usage()))?;
                stake_interval_set = true;
            }
            "--reserve-balance" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --reserve-balance\n{}", usage()))?;
                reserve_balance = parse_coin_amount(&value)
                    .ok_or_else(|| format!("invalid reserve balance '{value}'\n{}", usage()))?;
                reserve_balance_set = true;
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let conf_file = conf_path.unwrap_or_else(|| PathBuf::from("stakd.conf"));
    if let Some(conf) = load_conf(&conf_file)? {
        let last = |key: &str| conf.get(key).and_then(|values| values.last());
        if !network_set {
            if let Some(raw) = last("network") {
                network = Network::parse(raw).ok_or_else(|| {
                    format!("invalid network '{raw}' in {}", conf_file.display())
                })?;
            } else {
                for (key, candidate) in
                    [("regtest", Network::Regtest), ("testnet", Network::Testnet)]
                {
                    if let Some(raw) = last(key) {
                        match parse_conf_bool(raw) {
                            Some(true) => {
                                network = candidate;
                                break;
                            }
                            Some(false) => {}
                            None => {
                                return Err(format!(
                                    "invalid {key} value '{raw}' in {}",
                                    conf_file.display()
                                ));
                            }
                        }
                    }
                }
            }
        }
        if !log_level_set {
            if let Some(raw) = last("loglevel") {
                log_level = logging::Level::parse(raw).ok_or_else(|| {
                    format!("invalid loglevel '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !log_format_set {
            if let Some(raw) = last("logformat") {
                log_format = logging::Format::parse(raw).ok_or_else(|| {
                    format!("invalid logformat '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !log_timestamps_set {
            if let Some(raw) = last("logtimestamps") {
                log_timestamps = parse_conf_bool(raw).ok_or_else(|| {
                    format!("invalid logtimestamps value '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !staking_set {
            if let Some(raw) = last("staking") {
                staking = parse_conf_bool(raw).ok_or_else(|| {
                    format!("invalid staking value '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !stake_interval_set {
            if let Some(raw) = last("stakeintervalms") {
                stake_interval_ms = parse_interval(raw).ok_or_else(|| {
                    format!("invalid stakeintervalms '{raw}' in {}", conf_file.display())
                })?;
            }
        }
        if !reserve_balance_set {
            if let Some(raw) = last("reservebalance") {
                reserve_balance = parse_coin_amount(raw).ok_or_else(|| {
                    format!("invalid reservebalance '{raw}' in {}", conf_file.display())
                })?;
            }
        }
    }

    Ok(CliAction::Run(Config {
        network,
        conf_path: conf_file,
        log_level,
        log_format,
        log_timestamps,
        staking,
        stake_interval_ms,
        reserve_balance,
    }))
}

/// Reads `key=value` lines. A missing file is not an error. Keys are
/// lowercased and a bare key means `1`.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_interval(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|ms| *ms > 0)
}

/// Parses a decimal coin amount such as `12.5` into base units.
pub fn parse_coin_amount(value: &str) -> Option<Amount> {
    let value = value.trim();
    let (whole, frac) = match value.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (value, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if frac.len() > 8 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole: Amount = if whole.is_empty() {
        0
    } else {
        if !whole.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        whole.parse().ok()?
    };
    let frac: Amount = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<8}").parse().ok()?
    };
    whole.checked_mul(COIN)?.checked_add(frac)
}

pub fn usage() -> String {
    [
        "Usage:",
        "  stakd [options]",
        "  stakd <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --network  Network to run (mainnet|testnet|regtest, default: mainnet)",
        "  --conf  Config file path (default: ./stakd.conf)",
        "  --log-level  Log level (error|warn|info|debug|trace, default: info)",
        "  --log-format  Log output format (text|json, default: text)",
        "  --log-timestamps  Prefix log lines with timestamps (default)",
        "  --no-log-timestamps  Disable log timestamps",
        "  --staking  Enable the staker (1|0, default: 1)",
        "  --stake-interval-ms  Delay between stake attempts (default: 500)",
        "  --reserve-balance  Coins kept out of staking (default: 0)",
    ]
    .join("\n")
}
