use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "mplc")]
#[command(version)]
#[command(about = "MPL to MIDI compiler", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile an MPL file to a standard MIDI file
    Compile {
        /// Input MPL file (reads from stdin if not specified)
        input: Option<PathBuf>,

        /// Output MIDI file (writes to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for resolving bare INCLUDE names
        #[arg(short = 'I', long, default_value = "inc")]
        include_dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let Command::Compile {
        input,
        output,
        include_dir,
    } = args.command;

    let mut compiler = mplc::Compiler::new();
    compiler.set_include_dir(include_dir);

    let sequence = match &input {
        Some(path) => compiler.compile_file(path),
        None => compiler.compile(std::io::stdin()),
    };

    let sequence = match sequence {
        Ok(sequence) => sequence,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    for warning in compiler.warnings() {
        eprintln!("{}", warning);
    }

    let result = match &output {
        Some(path) => std::fs::File::create(path)
            .and_then(|mut file| mplc::midi::write_smf(&sequence, &mut file)),
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            mplc::midi::write_smf(&sequence, &mut lock).and_then(|_| lock.flush())
        }
    };

    if let Err(err) = result {
        eprintln!("IO error: {}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
