use clap::Parser;

use rmoci::driver::stream_to_bytes;
use rmoci::{Client, Reference, RegClient};

/// Fetch and print a manifest, mostly for poking at registries while
/// debugging sync behavior.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    image_ref: String,

    /// list referrers instead of fetching the manifest
    #[arg(long)]
    referrers: bool,

    /// fetch the config blob too
    #[arg(long)]
    config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let r: Reference = args.image_ref.parse()?;
    let client = Client::new(RegClient::builder().build()?);

    if args.referrers {
        let head = client.manifest_head(&r).await?;
        let subject = r.with_digest(&head.digest().to_string())?;
        let referrers = client.referrer_list(&subject, &[]).await?;
        println!("{}", serde_json::to_string_pretty(&referrers)?);
        return Ok(());
    }

    let m = client.manifest_get(&r).await?;
    println!("{}", String::from_utf8_lossy(m.raw()));

    if args.config {
        if let Some(config) = m.config_descriptor() {
            let raw = stream_to_bytes(client.blob_get(&r, config).await?).await?;
            println!("{}", String::from_utf8_lossy(&raw));
        }
    }
    Ok(())
}
