use sea_orm_migration::prelude::*;

#[tokio::main]
async fn main() {
    cli::run_cli(quest_events_migration::Migrator).await;
}
