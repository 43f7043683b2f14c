use std::path::PathBuf;

use clap::Parser;
use course_server::{db, user::create_admin, utils::init_log};

/// Creates an admin account; registration over HTTP cannot.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(short, long, default_value = "database/course.db", env = "COURSE_SERVER_DATABASE")]
    database: PathBuf,
    #[arg(short, long)]
    email: String,
    #[arg(short, long, env = "ADMIN_PASSWORD")]
    password: String,
    #[arg(long, default_value = "")]
    first_name: String,
    #[arg(long, default_value = "")]
    last_name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _guard = init_log(None);
    let args = Args::parse();
    let database = db::connect(&args.database).await?;
    let admin = create_admin(
        &database,
        args.email,
        args.password,
        args.first_name,
        args.last_name,
    )
    .await?;
    println!("admin {} created with id {}", admin.email, admin.id);
    Ok(())
}
