use std::{env, io, net::SocketAddr, process, time::Duration};

use sswire::{Config, Server};

fn usage() -> ! {
    eprintln!("usage: sswire-server <listen_addr> <password> [method] [--auth] [--timeout <secs>]");
    process::exit(2);
}

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut listen: Option<SocketAddr> = None;
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
                    0 => listen = Some(arg.parse().unwrap_or_else(|_| usage())),
                    1 => password = Some(arg),
                    2 => method = arg,
                    _ => usage(),
                }
                positional += 1;
            }
        }
    }
    let (Some(listen), Some(password)) = (listen, password) else {
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

    let server = Server::bind(listen, &config).await?;
    server.run().await
}
