use glomers::broadcast::Broadcast;
use glomers::broadcast::Config;
use glomers::stdio::Stdio;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    glomers::stdio::install_logging();

    let config = match std::env::var("GLOMERS_BROADCAST").as_deref() {
        Ok("flood") => Config::flood_fill(),
        Ok("tree") | Err(_) => Config::tree(),
        Ok(other) => return Err(format!("unknown broadcast strategy `{}`", other).into()),
    };

    let pool = futures::executor::ThreadPool::new()?;
    let stdio = Stdio::new();
    let broadcast = Broadcast::spawn(stdio.clone(), pool.clone(), config)?;

    glomers::stdio::serve(&stdio, broadcast, pool)?;

    Ok(())
}
