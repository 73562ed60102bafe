#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tsdb_server::serve().await
}
