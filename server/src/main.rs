use sandgate_common::runtime::RuntimeBuilder;

mod cli;
mod env;
mod error;
mod guacd;
mod handshake;
mod http;
mod reaper;
mod registry;
mod server;
mod state;
mod store;
mod supervisor;
mod tunnel;
mod workloads;
mod ws;

fn main() -> anyhow::Result<()> {
    let rt = RuntimeBuilder::create().build()?;

    rt.block_on(async {
        let cli = cli::parse();
        match cli.command {
            Some(cli::Commands::Start) | None => {
                sandgate_common::logger::init("sandgate:server");
                let config = env::init()?;
                server::start(config).await
            }
            Some(cli::Commands::Version) => {
                println!("{}", env::version());
                Ok(())
            }
        }
    })
}
