fn main() {
    if handle_cli_flags() {
        return;
    }

    if let Err(err) = postboard::run() {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("Postboard {}", postboard::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "Postboard - community board client.\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n\nWith no flags, prints the newest posts.\nConfig: {}",
                    postboard::config::default_path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<none>".into())
                );
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
