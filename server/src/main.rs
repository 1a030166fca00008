#[tokio::main]
async fn main() {
    if let Err(err) = chat_relay::app::run().await {
        tracing::error!(error = %err, "chat relay stopped");
        eprintln!("chat-relay: {err}");
        std::process::exit(1);
    }
}
