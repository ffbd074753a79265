//! Punto de entrada ("driver").
//!
//! Este módulo orquesta las diferentes fases del proceso de
//! compilación y expone una CLI.

use anyhow::{self, bail, Context};
use ccx::{
    config::{Backend, Config, DumpFlags},
    link::{LinkOptions, Linker},
    source::Source,
};

use clap::{self, crate_version, Arg, Command};
use std::{
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    process,
    rc::Rc,
};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Parsing de CLI
    let args = Command::new("ccx")
        .about("C subset compiler for x86-64")
        .version(crate_version!())
        .arg(
            Arg::new("input")
                .value_name("FILE")
                .required(true)
                .help("Source file ('-' for stdin)"),
        )
        .arg(
            Arg::new("asm")
                .short('S')
                .help("Generate assembly instead of linking"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .takes_value(true)
                .value_name("FILE")
                .help("Output file (assembly goes to stdout if absent)"),
        )
        .arg(
            Arg::new("include")
                .short('I')
                .takes_value(true)
                .value_name("DIR")
                .default_value("./include")
                .help("Directory for #include \"...\""),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .takes_value(true)
                .value_name("BACKEND")
                .default_value("ir")
                .possible_values(&["stack", "ir"])
                .help("Code generator"),
        )
        .arg(
            Arg::new("implicit-decl")
                .long("implicit-decl")
                .help("Allow calls to undeclared functions, assumed to return int"),
        )
        .arg(Arg::new("dump-tokens").long("dump-tokens").help("Dump tokens to stderr"))
        .arg(Arg::new("dump-pp").long("dump-pp").help("Dump preprocessed tokens to stderr"))
        .arg(Arg::new("dump-ast").long("dump-ast").help("Dump the typed AST to stderr"))
        .arg(Arg::new("dump-ir").long("dump-ir").help("Dump IR to stderr"))
        .arg(Arg::new("strip").short('s').help("Strip executables"))
        .arg(Arg::new("static").long("static").help("Link statically"))
        .get_matches();

    // Se extraen argumentos necesarios
    let backend: Backend = args.value_of_t("backend")?;
    let include_dir = args.value_of("include").map(PathBuf::from).unwrap_or_default();

    let mut dump = DumpFlags::empty();
    for (flag, bit) in [
        ("dump-tokens", DumpFlags::TOKENS),
        ("dump-pp", DumpFlags::PREPROCESSED),
        ("dump-ast", DumpFlags::AST),
        ("dump-ir", DumpFlags::IR),
    ] {
        if args.is_present(flag) {
            dump |= bit;
        }
    }

    let config = Config {
        include_dir,
        backend,
        implicit_decls: args.is_present("implicit-decl"),
        dump,
    };

    let input = args.value_of("input").unwrap_or("-");
    let source = load(input)?;

    let asm = match ccx::compile(source, &config) {
        Ok(asm) => asm,
        Err(diagnostics) => {
            eprint!("{}", diagnostics);
            process::exit(1);
        }
    };

    match (args.is_present("asm"), args.value_of("output")) {
        // Salida a stdout sin enlazado
        (_, None) | (true, Some("-")) => {
            let mut stdout = io::stdout();
            stdout.write_all(&asm).context("Failed to emit to stdout")?;
        }

        // Salida a archivo sin enlazado
        (true, Some(path)) => {
            fs::write(path, &asm).with_context(|| format!("Failed to emit to file: {}", path))?;
        }

        // Salida a stdout con enlazado
        (false, Some("-")) => bail!("Refusing to write executable to stdout"),

        // Salida a archivo con enlazado
        (false, Some(path)) => {
            let mut options = LinkOptions::empty();
            if args.is_present("strip") {
                options |= LinkOptions::STRIP;
            }

            if args.is_present("static") {
                options |= LinkOptions::STATIC;
            }

            let mut linker = Linker::spawn(&path, options).context("Failed to link")?;
            linker
                .stdin()
                .write_all(&asm)
                .context("Failed to emit assembly to assembler")?;

            linker
                .finish()
                .with_context(|| format!("Failed to generate executable: {}", path))?;
        }
    };

    Ok(())
}

fn load(input: &str) -> anyhow::Result<Rc<Source>> {
    if input == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read from stdin")?;

        Ok(Source::new("<stdin>", text))
    } else {
        Source::load(input).with_context(|| format!("Failed to read source file: {}", input))
    }
}
