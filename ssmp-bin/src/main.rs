use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{error, info, warn};

use ssmp_server::{open_scheme, secret_scheme, MultiSchemeAuthenticator, Server};

struct Options {
    listen: String,
    open: bool,
    secret: Option<PathBuf>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
}

fn usage() -> ! {
    eprintln!(
        "usage: ssmpd [--listen <addr>] [--open] [--secret <file>] \
         [--tls-cert <file> --tls-key <file>]"
    );
    process::exit(2);
}

fn parse_options() -> Options {
    let mut options = Options {
        listen: "0.0.0.0:8787".to_owned(),
        open: false,
        secret: None,
        tls_cert: None,
        tls_key: None,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => options.listen = args.next().unwrap_or_else(|| usage()),
            "--open" => options.open = true,
            "--secret" => options.secret = Some(args.next().unwrap_or_else(|| usage()).into()),
            "--tls-cert" => options.tls_cert = Some(args.next().unwrap_or_else(|| usage()).into()),
            "--tls-key" => options.tls_key = Some(args.next().unwrap_or_else(|| usage()).into()),
            _ => usage(),
        }
    }
    if options.tls_cert.is_some() != options.tls_key.is_some() {
        usage();
    }
    options
}

fn load_tls(cert_path: &Path, key_path: &Path) -> io::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(fs::File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(fs::File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let options = parse_options();

    let mut auth = MultiSchemeAuthenticator::new();
    if options.open {
        warn!("open login is enabled");
        auth = auth.with_scheme("open", open_scheme());
    }
    if let Some(path) = &options.secret {
        let mut secret = match fs::read(path) {
            Ok(secret) => secret,
            Err(e) => {
                error!("failed to read secret file {}: {e}", path.display());
                process::exit(1);
            }
        };
        while secret.last().is_some_and(u8::is_ascii_whitespace) {
            secret.pop();
        }
        auth = auth.with_scheme("secret", secret_scheme(secret));
    }

    let tls = match (&options.tls_cert, &options.tls_key) {
        (Some(cert), Some(key)) => match load_tls(cert, key) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!("failed to load TLS configuration: {e}");
                process::exit(1);
            }
        },
        _ => {
            warn!("TLS is disabled");
            None
        }
    };

    let listener = match TcpListener::bind(options.listen.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {e}", options.listen);
            process::exit(1);
        }
    };
    let server = Server::new(listener, Arc::new(auth), tls);
    match server.local_addr() {
        Ok(addr) => info!("ssmpd serving at {addr}"),
        Err(e) => {
            error!("listener error: {e}");
            process::exit(1);
        }
    }

    // SIGUSR1 dumps registry and counter snapshots to stdout
    let stats_server = server.clone();
    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(usr1) => usr1,
            Err(e) => {
                warn!("failed to install SIGUSR1 handler: {e}");
                return;
            }
        };
        while usr1.recv().await.is_some() {
            if let Err(e) = stats_server.dump_stats(&mut io::stdout()) {
                warn!("stats dump failed: {e}");
            }
        }
    });

    if let Err(e) = server.serve().await {
        error!("server error: {e}");
        process::exit(1);
    }
}
