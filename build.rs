// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("noorm")
        .version(env!("CARGO_PKG_VERSION"))
        .author("noorm Contributors")
        .about("Team-oriented database schema and change management")
        .subcommand_required(false)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .num_args(0)
                .help("Machine-readable JSON output"),
        )
        .arg(
            Arg::new("headless")
                .short('H')
                .long("headless")
                .global(true)
                .num_args(0)
                .help("Non-interactive execution"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_name("NAME")
                .help("Override the active config for this command"),
        )
        .subcommand(Command::new("init").about("Initialize this project"))
        .subcommand(
            Command::new("config")
                .about("Manage named connection configs")
                .subcommand(Command::new("add").about("Add or update a config"))
                .subcommand(Command::new("use").about("Select the active config"))
                .subcommand(Command::new("test").about("Verify a config's connection"))
                .subcommand(Command::new("list").about("List configs"))
                .subcommand(Command::new("show").about("Show one config"))
                .subcommand(Command::new("remove").about("Remove a config and its secrets")),
        )
        .subcommand(
            Command::new("secret")
                .about("Manage config-scoped and app-level secrets")
                .subcommand(Command::new("set").about("Set a secret"))
                .subcommand(Command::new("unset").about("Remove a secret"))
                .subcommand(Command::new("list").about("List secret keys")),
        )
        .subcommand(
            Command::new("change")
                .about("Create, inspect, and execute changes")
                .subcommand(Command::new("new").about("Scaffold a new change"))
                .subcommand(Command::new("add-file").about("Add a file to a change"))
                .subcommand(Command::new("rename").about("Rename a change's slug"))
                .subcommand(Command::new("reorder").about("Resequence one side of a change"))
                .subcommand(Command::new("delete").about("Delete an unapplied change"))
                .subcommand(Command::new("list").about("List changes with derived status"))
                .subcommand(Command::new("run").about("Apply one change"))
                .subcommand(Command::new("revert").about("Revert one change"))
                .subcommand(Command::new("next").about("Apply the next pending change"))
                .subcommand(Command::new("ff").about("Apply all pending changes"))
                .subcommand(Command::new("rewind").about("Revert the last N applied changes"))
                .subcommand(Command::new("history").about("Show operation history"))
                .subcommand(Command::new("forget").about("Remove an orphan from history")),
        )
        .subcommand(
            Command::new("run")
                .about("Run schema files")
                .subcommand(Command::new("build").about("Run the schema build"))
                .subcommand(Command::new("file").about("Run a single SQL file"))
                .subcommand(Command::new("dir").about("Run every SQL file under a directory")),
        )
        .subcommand(
            Command::new("lock")
                .about("Inspect or manage the cooperative database lock")
                .subcommand(Command::new("status").about("Show who holds the lock"))
                .subcommand(Command::new("acquire").about("Take the lock"))
                .subcommand(Command::new("release").about("Release the lock you hold"))
                .subcommand(Command::new("force").about("Delete the lock row regardless of holder")),
        )
        .subcommand(
            Command::new("db")
                .about("Inspect or reset database objects")
                .subcommand(Command::new("tables").about("List user tables"))
                .subcommand(Command::new("views").about("List user views"))
                .subcommand(Command::new("truncate").about("Delete all rows from one table"))
                .subcommand(Command::new("teardown").about("Drop all user objects")),
        )
        .subcommand(Command::new("reset").about("Tear down user objects, then rebuild"))
        .subcommand(
            Command::new("identity")
                .about("Show or sync the collaborator identity")
                .subcommand(Command::new("show").about("Show the local identity"))
                .subcommand(Command::new("sync").about("Sync the shared roster into state")),
        )
        .subcommand(Command::new("version").about("Print version and layer information"))
        .subcommand(Command::new("completions").about("Generate shell completion scripts"))
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("noorm.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
