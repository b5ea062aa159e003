use std::{env, path::PathBuf, process};

use anyhow::Context as _;
use mfs_server::net::Server;

fn usage() -> ! {
    let arg0 = env::args().next().unwrap_or_else(|| "mfs-server".into());
    eprintln!("Usage: {arg0} <port> <image-file>");
    process::exit(1);
}

fn main() -> anyhow::Result<()> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let [port, image] = args.as_slice() else {
        usage();
    };
    let Ok(port) = port.parse::<u16>() else {
        usage();
    };
    let image = PathBuf::from(image);

    let mut server = Server::bind(port, &image)
        .with_context(|| format!("failed to start on image {}", image.display()))?;
    let addr = server.local_addr().context("failed to read bound address")?;
    println!(
        "mfs-server: serving {} on UDP port {}",
        image.display(),
        addr.port()
    );

    server.run().context("server aborted")?;
    println!("mfs-server: shutdown complete");
    Ok(())
}
