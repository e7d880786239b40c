use mainline::{router, Dht, DhtEvent, InfoHash, LengthError};
use std::{
    convert::TryFrom,
    net::{SocketAddr, SocketAddrV4},
    str::FromStr,
    time::Instant,
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net,
};

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let routers = resolve_routers().await;
    let (dht, mut events) = Dht::builder().start().await.unwrap();

    match events.recv().await {
        Some(DhtEvent::Listening(addr)) => println!("listening on {}", addr),
        other => {
            println!("node failed to start: {:?}", other);
            return;
        }
    }

    println!("bootstrapping against {} routers...", routers.len());
    let start = Instant::now();

    for router in routers {
        dht.connect(router).await.unwrap();
    }

    let elapsed = start.elapsed();
    println!(
        "bootstrap completed in {}.{:03} seconds",
        elapsed.as_secs(),
        elapsed.subsec_millis()
    );

    let mut stdout = io::stdout();
    let mut stdin = BufReader::new(io::stdin());
    let mut line = String::new();

    loop {
        stdout.write_all(b"> ").await.unwrap();
        stdout.flush().await.unwrap();

        line.clear();

        if stdin.read_line(&mut line).await.unwrap() == 0 {
            break;
        }

        if !handle_command(&dht, &line).await {
            break;
        }
    }

    dht.close().await;
}

async fn resolve_routers() -> Vec<SocketAddrV4> {
    let mut routers = Vec::new();

    for host in [router::BITTORRENT_DHT, router::TRANSMISSION_DHT] {
        match net::lookup_host(host).await {
            Ok(addrs) => routers.extend(addrs.filter_map(|addr| match addr {
                SocketAddr::V4(addr) => Some(addr),
                SocketAddr::V6(_) => None,
            })),
            Err(cause) => println!("failed to resolve {}: {}", host, cause),
        }
    }

    routers
}

async fn handle_command(dht: &Dht, command: &str) -> bool {
    match command.parse() {
        Ok(Command::Help) => {
            println!("    h                      shows this help message");
            println!("    s <INFO_HASH>          search for peers of the info hash");
            println!("    a <INFO_HASH> <PORT>   announce ourselves for the info hash");
            println!("    q                      quit");
        }
        Ok(Command::Search { info_hash }) => {
            println!("searching for {:?}...", info_hash);
            report(dht.lookup(info_hash).await);
        }
        Ok(Command::Announce { info_hash, port }) => {
            println!("announcing {:?} on port {}...", info_hash, port);
            report(dht.advertise(info_hash, port).await);
        }
        Ok(Command::Quit) => return false,
        Err(_) => println!("invalid command (use 'h' for help)"),
    }

    true
}

fn report(outcome: Result<Vec<SocketAddrV4>, mainline::ClosedError>) {
    match outcome {
        Ok(peers) => {
            for peer in &peers {
                println!("peer found: {}", peer);
            }
            println!("search completed: {} peers", peers.len());
        }
        Err(cause) => println!("search failed: {}", cause),
    }
}

enum Command {
    Help,
    Search { info_hash: InfoHash },
    Announce { info_hash: InfoHash, port: u16 },
    Quit,
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();

        match words.next() {
            Some("h") | Some("?") => Ok(Self::Help),
            Some("s") => Ok(Self::Search {
                info_hash: parse_info_hash(words.next().ok_or(ParseError)?)?,
            }),
            Some("a") => Ok(Self::Announce {
                info_hash: parse_info_hash(words.next().ok_or(ParseError)?)?,
                port: words.next().ok_or(ParseError)?.parse().map_err(|_| ParseError)?,
            }),
            Some("q") => Ok(Self::Quit),
            _ => Err(ParseError),
        }
    }
}

struct ParseError;

impl From<hex::FromHexError> for ParseError {
    fn from(_: hex::FromHexError) -> Self {
        ParseError
    }
}

impl From<LengthError> for ParseError {
    fn from(_: LengthError) -> Self {
        ParseError
    }
}

fn parse_info_hash(s: &str) -> Result<InfoHash, ParseError> {
    if let Some(text) = s.strip_prefix('#') {
        Ok(InfoHash::sha1(text.as_bytes()))
    } else {
        Ok(InfoHash::try_from(hex::decode(s)?.as_ref())?)
    }
}
