use glomers::ids::IdGenerator;
use glomers::stdio::Stdio;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    glomers::stdio::install_logging();

    let pool = futures::executor::ThreadPool::new()?;
    let stdio = Stdio::new();
    let ids = IdGenerator::new(stdio.clone());

    glomers::stdio::serve(&stdio, ids, pool)?;

    Ok(())
}
