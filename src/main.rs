use log::error;

use em340_bridge::options::Options;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(err) = em340_bridge::app(options).await {
        error!("{}", err);
        std::process::exit(1);
    }
}
