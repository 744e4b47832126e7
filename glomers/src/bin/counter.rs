use glomers::counter::Counter;
use glomers::kv::KvClient;
use glomers::stdio::Stdio;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    glomers::stdio::install_logging();

    let pool = futures::executor::ThreadPool::new()?;
    let stdio = Stdio::new();
    let counter = Counter::new(KvClient::sequential(stdio.clone()));

    glomers::stdio::serve(&stdio, counter, pool)?;

    Ok(())
}
