use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use vcz_sim::{args::Args, config::Config, error::Error, sim::Simulation};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(args.config.as_deref()).await?.merge(&args);

    let mut sim = Simulation::new(config)?;
    let stats = sim.run().await?;

    println!("{stats}");

    Ok(())
}
