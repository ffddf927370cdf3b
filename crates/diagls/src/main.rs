//
// main.rs
//
// Entry point for the diagls language server
//

use std::env;

use diagls::backend;

fn print_usage() {
    println!(
        "diagls {}, a language server for containerized PHP analysis tools.",
        env!("CARGO_PKG_VERSION")
    );
    print!(
        r#"
Usage: diagls [OPTIONS]

Available options:

--stdio                      Start the LSP server using stdio transport
--version                    Print the version
--help                       Print this help message

The project root must contain a .diagls.json configuration file.
Set RUST_LOG (e.g. RUST_LOG=diagls=debug) to control logging on stderr.

"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut argv = env::args();
    argv.next(); // skip executable name

    let mut use_stdio = false;

    for arg in argv {
        match arg.as_str() {
            "--stdio" => use_stdio = true,
            "--version" => {
                println!("diagls {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                return Err(anyhow::anyhow!("Unknown argument: '{other}'"));
            }
        }
    }

    if !use_stdio {
        print_usage();
        return Ok(());
    }

    env_logger::init();

    backend::start_lsp().await
}
