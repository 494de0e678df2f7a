#[tokio::main]
async fn main() {
    keeper::start(std::env::args()).await;
}
