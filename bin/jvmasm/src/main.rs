use jvmasm::jvm::class_file::{Attribute, ClassFile};
use jvmasm::jvm::{Error, Settings};

use clap::{crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};

fn main() -> Result<(), Error> {
    env_logger::init();

    let matches = Command::new("JVM class file assembler")
        .version(crate_version!())
        .about("Inspect and rewrite JVM class files")
        .subcommand_required(true)
        .arg(
            Arg::new("keep-pool-order")
                .long("keep-pool-order")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Extend the existing constant pool instead of rebuilding and sorting it"),
        )
        .subcommand(
            Command::new("dump")
                .about("Print the structure of a class and a listing of every method")
                .arg(
                    Arg::new("CLASS")
                        .help("Class file to read")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("rewrite")
                .about("Disassemble and reassemble every method of a class")
                .arg(
                    Arg::new("INPUT")
                        .help("Class file to read")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("OUTPUT")
                        .help("Where to write the rewritten class")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .get_matches();

    let settings = Settings {
        optimize_constant_pool: !matches.get_flag("keep-pool-order"),
        ..Settings::default()
    };

    match matches.subcommand() {
        Some(("dump", sub)) => dump(&path_arg(sub, "CLASS"), settings),
        Some(("rewrite", sub)) => rewrite(
            &path_arg(sub, "INPUT"),
            &path_arg(sub, "OUTPUT"),
            settings,
        ),
        _ => unreachable!("a subcommand is required"),
    }
}

fn path_arg(matches: &ArgMatches, name: &str) -> PathBuf {
    match matches.get_one::<PathBuf>(name) {
        Some(path) => path.clone(),
        None => unreachable!("{} is a required argument", name),
    }
}

fn read(path: &Path, settings: Settings) -> Result<ClassFile, Error> {
    log::info!("Reading '{}'", path.display());
    ClassFile::read_from_path(path, settings)
}

fn dump(path: &Path, settings: Settings) -> Result<(), Error> {
    let mut class = read(path, settings)?;

    let contents = class.contents()?;
    println!("class {} (version {})", contents.this_class, contents.version);
    println!("  flags: {:?}", contents.access_flags);
    if let Some(super_class) = &contents.super_class {
        println!("  extends {}", super_class);
    }
    for interface in &contents.interfaces {
        println!("  implements {}", interface);
    }
    println!("  {} constants", contents.constant_pool().len());
    for attribute in &contents.attributes {
        println!("  attribute {}", attribute.name());
    }
    for field in &contents.fields {
        println!();
        println!("field {} {} {:?}", field.name, field.descriptor, field.access_flags);
        for attribute in &field.attributes {
            match attribute {
                Attribute::ConstantValue(constant) => println!("  = {:?}", constant),
                other => println!("  attribute {}", other.name()),
            }
        }
    }

    let methods: Vec<(String, String, String)> = contents
        .methods
        .iter()
        .map(|method| {
            (
                method.name.clone(),
                method.descriptor.clone(),
                format!("{:?}", method.access_flags),
            )
        })
        .collect();
    for (name, descriptor, flags) in methods {
        println!();
        println!("method {}{} {}", name, descriptor, flags);
        if let Some(code) = class.code_mut(&name, &descriptor)? {
            println!(
                "  max stack {}, max locals {}",
                code.max_stack(),
                code.max_locals()
            );
            for line in code.listing()?.lines() {
                println!("  {}", line);
            }
        }
    }
    Ok(())
}

fn rewrite(input: &Path, output: &Path, settings: Settings) -> Result<(), Error> {
    let mut class = read(input, settings)?;

    // Touching the methods forces every body through disassembly and reassembly
    let contents = class.contents_mut()?;
    for method in &mut contents.methods {
        if let Some(code) = method.code_mut() {
            code.ops_mut()?;
        }
    }

    log::info!("Writing '{}'", output.display());
    class.save_to_path(output, true)
}
