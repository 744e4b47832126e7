use glomers::kv::KvClient;
use glomers::log::KvLog;
use glomers::log::LocalLog;
use glomers::log::LogHandler;
use glomers::stdio::Stdio;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    glomers::stdio::install_logging();

    let pool = futures::executor::ThreadPool::new()?;
    let stdio = Stdio::new();

    match std::env::var("GLOMERS_QUEUE").as_deref() {
        Ok("kv") | Err(_) => {
            let log = KvLog::new(
                KvClient::linearizable(stdio.clone()),
                KvClient::sequential(stdio.clone()),
            );

            glomers::stdio::serve(&stdio, LogHandler::new(log), pool)?;
        }
        Ok("local") => {
            glomers::stdio::serve(&stdio, LogHandler::new(LocalLog::new()), pool)?;
        }
        Ok(other) => return Err(format!("unknown queue variant `{}`", other).into()),
    }

    Ok(())
}
