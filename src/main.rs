use std::{
    net::Ipv4Addr,
    process,
    time::{Duration, Instant},
};

use anyhow::Result;
use clap::{
    arg, crate_authors, crate_name, crate_version, value_parser, ArgAction, ArgMatches, Command,
};
use pad::PadStr;
use portscan::{
    error::ScanError,
    guess::{self, Service},
    interrupt, liveness, logger,
    port::PortSelection,
    resolver,
    scan::{OpenPort, ScanType, TcpScanner, UdpScanner},
};

struct ParsedArgs {
    debug: bool,
    verbose: bool,
    guess: bool,
    timeout: f64,
    ports: PortSelection,
    target: String,
}

fn parse_args(matches: ArgMatches) -> Result<ParsedArgs, ScanError> {
    let timeout = *matches.get_one::<f64>("timeout").unwrap();
    if !timeout.is_finite() || timeout <= 0.0 {
        return Err(ScanError::InvalidTimeout(timeout));
    }

    let ports = PortSelection::parse(
        matches
            .get_many::<String>("ports")
            .into_iter()
            .flatten()
            .map(String::as_str),
    )?;

    Ok(ParsedArgs {
        debug: matches.get_flag("debug"),
        verbose: matches.get_flag("verbose"),
        guess: matches.get_flag("guess"),
        timeout,
        ports,
        target: matches.get_one::<String>("target").unwrap().to_owned(),
    })
}

struct Row {
    kind: ScanType,
    port: u16,
    rtt_ms: u64,
    service: Option<Service>,
}

fn probe_for(kind: ScanType) -> fn(Ipv4Addr, u16) -> Option<Service> {
    match kind {
        ScanType::Syn => guess::tcp,
        ScanType::Udp => guess::udp,
    }
}

fn to_rows(
    ip: Ipv4Addr,
    kind: ScanType,
    open: &[OpenPort],
    guess: bool,
) -> Result<Vec<Row>, ScanError> {
    let services = if guess {
        let ports = open.iter().map(|o| o.port).collect::<Vec<_>>();
        guess::identify_all(ip, &ports, probe_for(kind), interrupt::requested)?
    } else {
        vec![None; open.len()]
    };

    Ok(open
        .iter()
        .zip(services)
        .map(|(o, service)| Row {
            kind,
            port: o.port,
            rtt_ms: o.rtt_ms,
            service,
        })
        .collect())
}

fn scan(ip: Ipv4Addr, args: &ParsedArgs) -> Result<Vec<Row>, ScanError> {
    let mut out = Vec::new();

    if let Some(ports) = &args.ports.tcp {
        match TcpScanner::new(ip, ports.clone(), args.timeout) {
            Ok(scanner) => {
                let open = scanner.scan()?;
                out.extend(to_rows(ip, ScanType::Syn, &open, args.guess)?);
            }
            Err(e @ ScanError::PermissionRequired(_)) => eprintln!("TCP scan aborted: {}", e),
            Err(e) => return Err(e),
        }
    }

    if let Some(ports) = &args.ports.udp {
        match UdpScanner::new(ip, ports.clone(), args.timeout) {
            Ok(scanner) => {
                let report = scanner.scan()?;
                out.extend(to_rows(ip, ScanType::Udp, &report.open, args.guess)?);

                if args.guess {
                    // Silent ports may still speak a protocol we know.
                    let services = guess::identify_all(
                        ip,
                        &report.no_response,
                        guess::udp,
                        interrupt::requested,
                    )?;
                    out.extend(report.no_response.iter().zip(services).filter_map(
                        |(&port, service)| {
                            service.map(|service| Row {
                                kind: ScanType::Udp,
                                port,
                                rtt_ms: 0,
                                service: Some(service),
                            })
                        },
                    ));
                }
            }
            Err(e @ ScanError::PermissionRequired(_)) => eprintln!("UDP scan aborted: {}", e),
            Err(e) => return Err(e),
        }
    }

    Ok(out)
}

/// Leaves with the conventional SIGINT status once the user gave up.
fn exit_if_interrupted<T>(res: Result<T, ScanError>) -> Result<T, ScanError> {
    if let Err(ScanError::Interrupted) = res {
        eprintln!("Interrupted by user");
        process::exit(130);
    }
    res
}

fn banner(name: Option<&str>, target: &str, ip: Ipv4Addr) -> String {
    format!("Starting PortScan for {} ({})\n\n", name.unwrap_or(target), ip)
}

fn print_results(args: &ParsedArgs, ip: Ipv4Addr, rows: &[Row], elapsed: f32) {
    let name = resolver::reverse(ip);
    let mut out = banner(name.as_deref(), &args.target, ip);

    if rows.is_empty() {
        out.push_str("Nothing found\n");
    } else {
        out.push_str(&format!("{}{}", "TCP|UDP".pad_to_width(9), "PORT".pad_to_width(7)));
        if args.verbose {
            out.push_str(&"[TIME, ms]".pad_to_width(12));
        }
        if args.guess {
            out.push_str("PROTOCOL");
        }
        out.push('\n');

        rows.iter().for_each(|row| {
            out.push_str(&format!("{:<9}{:<7}", row.kind.to_string(), row.port));
            if args.verbose {
                out.push_str(&format!("{}", row.rtt_ms).pad_to_width(12));
            }
            if args.guess {
                out.push_str(&row.service.map(|s| s.to_string()).unwrap_or_default());
            }
            out.push('\n');
        });
    }

    out.push_str(&format!("\nScan done: scanned in {:.2} seconds\n", elapsed));

    print!("{}", out);
}

fn main() -> Result<()> {
    let arg_matches = Command::new(crate_name!())
        .about(
            "TCP SYN and UDP port scanner.\n\
            Raw sockets are used, so it must run as sudo.",
        )
        .version(crate_version!())
        .arg_required_else_help(true)
        .author(crate_authors!())
        .args([
            arg!(-d --debug "Turns on debugging information").action(ArgAction::SetTrue),
            arg!(-v --verbose "Shows response time of each port").action(ArgAction::SetTrue),
            arg!(-g --guess "Guesses the application protocol of open ports")
                .action(ArgAction::SetTrue),
            arg!(-t --timeout <SECS> "Response timeout in seconds")
                .value_parser(value_parser!(f64))
                .default_value("2.0"),
            arg!(<target> "Address or hostname to scan"),
            arg!([ports] ... "Ports to scan, e.g. `tcp`, `udp/53` or `tcp/1-1024,8080`"),
        ])
        .get_matches();

    // Extract arguments.
    let parsed = parse_args(arg_matches)?;

    // Set debug if desired.
    if parsed.debug {
        logger::init();
    }

    interrupt::install()?;

    // Parse target.
    let ip = resolver::lookup(&parsed.target)?;

    // Make sure someone is there before flooding it with probes.
    let timeout = Duration::try_from_secs_f64(parsed.timeout)
        .map_err(|_| ScanError::InvalidTimeout(parsed.timeout))?;
    match exit_if_interrupted(liveness::check(ip, timeout)) {
        Err(ScanError::PermissionRequired(e)) => {
            log::debug!("Skipping liveness check: {}", e)
        }
        res => res?,
    }

    let start = Instant::now();
    let rows = exit_if_interrupted(scan(ip, &parsed))?;

    print_results(&parsed, ip, &rows, start.elapsed().as_secs_f32());

    Ok(())
}
