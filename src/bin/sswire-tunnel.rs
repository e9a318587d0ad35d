use std::{
    env, io,
    net::{IpAddr, SocketAddr},
    process,
    time::Duration,
};

use sswire::{Address, Config, Tunnel};

fn usage() -> ! {
    eprintln!(
        "usage: sswire-tunnel <local_addr> <server_addr> <dest_host:port> <password> [method] [--auth] [--timeout <secs>]"
    );
    process::exit(2);
}

fn parse_dest(dest: &str) -> Option<(Address, u16)> {
    let (host, port) = dest.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let addr = match host.parse::<IpAddr>() {
        Ok(ip) => Address::from(ip),
        Err(_) if !host.is_empty() && host.len() <= 255 => Address::Domain(host.to_owned()),
        Err(_) => return None,
    };
    Some((addr, port))
}

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut local: Option<SocketAddr> = None;
    let mut server: Option<SocketAddr> = None;
    let mut dest: Option<(Address, u16)> = None;
    let mut password: Option<String> = None;
    let mut method = String::from("aes-128-cfb");
    let mut auth = false;
    let mut timeout: Option<u64> = None;

    let mut args = env::args().skip(1);
    let mut positional = 0;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--auth" => auth = true,
            "--timeout" => {
                let secs = args.next().unwrap_or_else(|| usage());
                timeout = Some(secs.parse().unwrap_or_else(|_| usage()));
            }
            _ => {
                match positional {
                    0 => local = Some(arg.parse().unwrap_or_else(|_| usage())),
                    1 => server = Some(arg.parse().unwrap_or_else(|_| usage())),
                    2 => dest = Some(parse_dest(&arg).unwrap_or_else(|| usage())),
                    3 => password = Some(arg),
                    4 => method = arg,
                    _ => usage(),
                }
                positional += 1;
            }
        }
    }
    let (Some(local), Some(server), Some((dest, dest_port)), Some(password)) =
        (local, server, dest, password)
    else {
        usage()
    };

    let builder = Config::builder_with_passphrase(password).with_cipher_name(&method);
    let mut config = if auth {
        builder.with_one_time_auth()
    } else {
        builder.no_auth()
    };
    if let Some(secs) = timeout {
        config = config.with_idle_timeout(Duration::from_secs(secs));
    }

    let tunnel = Tunnel::bind(local, server, dest, dest_port, &config).await?;
    tunnel.run().await
}
