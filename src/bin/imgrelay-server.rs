use imgrelay::{Dispatcher, Env, RelayState, server};
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "usage: imgrelay-server [--listen HOST:PORT] [--static-dir PATH] [--role-file PATH] [--dotenv PATH]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut listen = "127.0.0.1:8000".to_string();
    let mut static_dir: Option<String> = None;
    let mut role_file: Option<String> = None;
    let mut dotenv_path: Option<String> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--static-dir" => {
                static_dir = Some(args.next().ok_or("missing value for --static-dir")?);
            }
            "--role-file" => {
                role_file = Some(args.next().ok_or("missing value for --role-file")?);
            }
            "--dotenv" => {
                dotenv_path = Some(args.next().ok_or("missing value for --dotenv")?);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}\n{USAGE}").into());
            }
        }
    }

    let env = match dotenv_path {
        Some(path) => Env::parse_dotenv(&std::fs::read_to_string(&path)?),
        None => Env::default(),
    };

    let mut state = RelayState::new(Dispatcher::new(env));
    if let Some(dir) = static_dir {
        state = state.with_static_dir(dir);
    }
    if let Some(path) = role_file {
        state = state.with_role_file(path);
    }

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "imgrelay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
