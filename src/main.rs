use getopts::Options;
use lispc::{
    cli::{self, Action},
    core::Config,
};
use std::{env, process::exit};

fn main() {
    let args: Vec<String> = env::args().collect();
    let bin = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("i", "", "Input file name", "FILE");
    opts.optopt("o", "", "Output file name, <stem>.s by default", "FILE");
    opts.optflag("E", "", "Stop after preprocessing and print the canonical form");
    opts.optflag("", "no-preprocess", "Treat the input as an already canonical program");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            exit(1)
        }
    };

    if matches.opt_present("h") {
        print!("{}", opts.usage(&format!("Usage: {} -i FILE [options]", bin)));
        return;
    }

    let Some(input) = matches.opt_str("i") else {
        eprintln!("{}", opts.usage(&format!("Usage: {} -i FILE [options]", bin)));
        exit(1)
    };

    let output = matches.opt_str("o").unwrap_or_else(|| format!("{}.s", cli::stem(&input)));

    let config = Config { input, output, no_preprocess: matches.opt_present("no-preprocess") };

    let action = if matches.opt_present("E") { Action::Preprocess } else { Action::Compile };

    if let Err(e) = cli::run(&config, action) {
        eprintln!("{}", e);
        exit(1)
    }
}
