// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn flag(id: &'static str, long: &'static str, help: &'static str) -> Arg {
    Arg::new(id).long(long).action(ArgAction::SetTrue).help(help)
}

fn build_cli() -> Command {
    Command::new("imgbuild")
        .version(env!("CARGO_PKG_VERSION"))
        .author("imgbuild contributors")
        .about("Build container filesystem images from definition files")
        .subcommand_required(false)
        .arg(flag("verbose", "verbose", "Show debug output").short('v'))
        .arg(flag("debug", "debug", "Show trace output").short('d'))
        .arg(flag("quiet", "quiet", "Only show warnings and errors").short('q'))
        .arg(flag("silent", "silent", "Only show errors").short('s'))
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Configuration file"),
        )
        .subcommand(
            Command::new("build")
                .about("Build an image from a definition file")
                .arg(Arg::new("definition").required(true).help("Path to the definition file"))
                .arg(Arg::new("dest").required(true).help("Where to write the image"))
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .default_value("image")
                        .help("Output format: image, sandbox, legacy"),
                )
                .arg(flag("sandbox", "sandbox", "Shorthand for --format sandbox"))
                .arg(flag("keep_tmp", "keep-tmp", "Keep the staging directory after the build"))
                .arg(flag("force", "force", "Overwrite an existing destination"))
                .arg(flag("unprivileged", "unprivileged", "Never switch privileges"))
                .arg(Arg::new("tmpdir").long("tmpdir").value_name("DIR").help("Parent directory for staging"))
                .arg(Arg::new("tokenfile").long("tokenfile").value_name("FILE").help("Registry token file"))
                .arg(
                    Arg::new("layout_store")
                        .long("layout-store")
                        .value_name("DIR")
                        .help("Directory of local OCI layouts"),
                ),
        )
        .subcommand(Command::new("check").about("List the external tools this host provides"))
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("imgbuild.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
