mod cli;

#[tokio::main]
async fn main() {
    let exit_code = cli::execute().await;
    std::process::exit(exit_code);
}
