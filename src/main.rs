fn main() {
    use clap::Parser;
    use std::error::Error;
    let args = naroudl::cli::Args::parse();
    naroudl::cli::init_tracing(&args);
    if let Err(e) = naroudl::cli::run(&args) {
        eprintln!("{}", e);
        if args.verbose > 0 {
            let mut source = e.source();
            while let Some(s) = source {
                eprintln!("  cause: {}", s);
                source = s.source();
            }
        }
        std::process::exit(e.exit_code());
    }
}
