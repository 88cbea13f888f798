//! evolverc: command-line driver for the x86-64 backend
//!
//! Reads a translation unit as JSON (the AST a frontend produced) and writes a
//! native executable.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use evolver::ast::TranslationUnit;
use evolver::x64::FunctionRecord;
use evolver::{build_image, compile, CodegenError, CompileOptions, CompiledProgram, ImageFormat};

#[derive(Parser)]
#[command(name = "evolverc")]
#[command(version)]
#[command(about = "x86-64 backend: AST in, ELF64 or PE32+ executable out", long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an AST to a native executable
    Build {
        /// Translation unit as JSON
        #[arg(value_name = "AST")]
        file: PathBuf,

        /// Output executable path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Executable format
        #[arg(long, value_enum, default_value_t = ImageFormat::Elf64)]
        format: ImageFormat,

        /// Reject identifiers that were never declared
        #[arg(long)]
        strict_locals: bool,

        /// C source the AST came from, for error snippets
        #[arg(long, value_name = "FILE")]
        source: Option<PathBuf>,

        /// Print errors as JSON
        #[arg(long)]
        json_errors: bool,
    },

    /// Lower an AST and print the function layout without writing anything
    Inspect {
        /// Translation unit as JSON
        #[arg(value_name = "AST")]
        file: PathBuf,

        /// Executable format the entry stub is generated for
        #[arg(long, value_enum, default_value_t = ImageFormat::Elf64)]
        format: ImageFormat,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Build {
            file,
            output,
            format,
            strict_locals,
            source,
            json_errors,
        } => {
            let options = CompileOptions::default()
                .format(format)
                .strict_locals(strict_locals);
            let reporter = Reporter {
                source: source.and_then(|path| fs::read_to_string(path).ok()),
                json: json_errors,
            };
            cmd_build(&file, output, &options, &reporter)
        }
        Commands::Inspect { file, format } => {
            cmd_inspect(&file, &CompileOptions::default().format(format))
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// How compile errors reach the user
struct Reporter {
    source: Option<String>,
    json: bool,
}

impl Reporter {
    fn report(&self, err: &CodegenError) {
        let diag = err.to_diagnostic();
        if self.json {
            println!("{}", diag.to_json());
            return;
        }
        match &self.source {
            Some(source) => eprint!("{}", diag.format_with_source(source)),
            None => eprintln!("{}: {}", "error".red().bold(), diag),
        }
    }
}

fn read_unit(file: &Path) -> Option<TranslationUnit> {
    let text = match fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "{}: could not read '{}': {}",
                "error".red().bold(),
                file.display(),
                e
            );
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(unit) => Some(unit),
        Err(e) => {
            eprintln!(
                "{}: '{}' is not a valid AST: {}",
                "error".red().bold(),
                file.display(),
                e
            );
            None
        }
    }
}

/// Output path when `-o` is not given. Never the input file itself.
fn default_output(file: &Path, format: ImageFormat) -> PathBuf {
    let stem = file.with_extension("");
    let output = match format.extension() {
        "" => stem,
        ext => stem.with_extension(ext),
    };
    if output == file {
        file.with_extension("out")
    } else {
        output
    }
}

fn cmd_build(
    file: &Path,
    output: Option<PathBuf>,
    options: &CompileOptions,
    reporter: &Reporter,
) -> ExitCode {
    let Some(unit) = read_unit(file) else {
        return ExitCode::FAILURE;
    };
    let output = output.unwrap_or_else(|| default_output(file, options.format));

    let result = compile(&unit, options).and_then(|program| {
        let image = build_image(&program)?;
        evolver::x64::write_image(&output, &image)?;
        Ok((program, image.len()))
    });

    match result {
        Ok((program, size)) => {
            println!(
                "{} {} ({}, {} bytes, {} function(s))",
                "Compiled".green().bold(),
                output.display(),
                program.format,
                size,
                program.functions.len() - 1
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            reporter.report(&e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_inspect(file: &Path, options: &CompileOptions) -> ExitCode {
    let Some(unit) = read_unit(file) else {
        return ExitCode::FAILURE;
    };
    match compile(&unit, options) {
        Ok(program) => {
            print_layout(&program);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e.to_diagnostic());
            ExitCode::FAILURE
        }
    }
}

fn print_layout(program: &CompiledProgram) {
    println!(
        "{} code, {} bytes, entry at {:#x}",
        program.format,
        program.code.len(),
        program.entry_offset
    );
    println!("{:<20} {:>8} {:>8} {:>8}", "function", "offset", "size", "frame");
    for func in &program.functions {
        println!("{}", layout_row(func));
    }
}

fn layout_row(func: &FunctionRecord) -> String {
    // Pad before colouring; escape codes would count toward the width.
    let name = format!("{:<20}", func.name);
    let name = if func.is_entry {
        name.cyan().to_string()
    } else {
        name
    };
    format!(
        "{} {:>#8x} {:>8} {:>8}",
        name, func.start_offset, func.size, func.stack_size
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_strips_extension() {
        assert_eq!(
            default_output(Path::new("p/prog.json"), ImageFormat::Elf64),
            PathBuf::from("p/prog")
        );
        assert_eq!(
            default_output(Path::new("p/prog.json"), ImageFormat::Pe64),
            PathBuf::from("p/prog.exe")
        );
    }

    #[test]
    fn test_default_output_never_overwrites_input() {
        let elf_input = Path::new("p/prog");
        let elf_output = default_output(elf_input, ImageFormat::Elf64);
        assert_ne!(elf_output, elf_input);
        assert_eq!(elf_output, PathBuf::from("p/prog.out"));

        let pe_input = Path::new("p/prog.exe");
        let pe_output = default_output(pe_input, ImageFormat::Pe64);
        assert_ne!(pe_output, pe_input);
        assert_eq!(pe_output, PathBuf::from("p/prog.out"));
    }

    #[test]
    fn test_layout_row_pads_before_colour() {
        colored::control::set_override(true);
        let entry = FunctionRecord {
            name: "_start".to_string(),
            start_offset: 0,
            size: 17,
            stack_size: 0,
            is_entry: true,
        };
        let row = layout_row(&entry);
        assert!(row.contains(&format!("{:<20}", "_start")));
        assert!(row.starts_with("\x1b["));

        let main = FunctionRecord {
            name: "main".to_string(),
            start_offset: 17,
            size: 23,
            stack_size: 16,
            is_entry: false,
        };
        let row = layout_row(&main);
        assert_eq!(row, format!("{:<20} {:>#8x} {:>8} {:>8}", "main", 17, 23, 16));
    }
}
