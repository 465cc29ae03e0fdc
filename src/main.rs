#[tokio::main]
async fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  if let Err(e) = mpv_bus_lib::run().await {
    log::error!("Config load error: {}", e);
    std::process::exit(1);
  }
}
