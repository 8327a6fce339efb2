// src/commands/check.rs

//! `imgbuild check`

use anyhow::Result;
use imgbuild::tools::HostTools;
use imgbuild::{BootstrapKind, ImageFormat};

/// Report which external tools are available
pub fn cmd_check() -> Result<()> {
    println!("Checking host tools...\n");

    let tools = HostTools::check();
    let status = |present: bool| if present { "[OK]" } else { "[MISSING]" };

    for tool in tools.tools() {
        println!(
            "  {} {}: {} (needed for {})",
            status(tool.is_present()),
            tool.name,
            tool.path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| format!("not found, install {}", tool.package)),
            tool.purpose
        );
    }

    println!("\nBootstrap kinds:");
    for kind in BootstrapKind::ALL {
        println!("  {} {}", status(tools.supports_bootstrap(kind)), kind);
    }

    println!("\nOutput formats:");
    for format in ImageFormat::ALL {
        println!("  {} {}", status(tools.supports_format(format)), format);
    }

    let missing = tools.missing();
    if !missing.is_empty() {
        println!("\nMissing tools only limit the kinds and formats marked above.");
    }
    Ok(())
}
