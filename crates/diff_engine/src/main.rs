use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;

fn main() {
    if let Err(error) = run() {
        eprintln!("apply_patch: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let mut args = std::env::args_os().skip(1);
    let root = match args.next() {
        Some(root) => PathBuf::from(root),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    if args.next().is_some() {
        anyhow::bail!("usage: apply_patch [ROOT] < patch.diff");
    }

    let mut diff = String::new();
    std::io::stdin()
        .read_to_string(&mut diff)
        .context("reading patch from stdin")?;

    let mut stdout = std::io::stdout().lock();
    diff_engine::apply_patch(&diff, &root, &mut stdout)
        .with_context(|| format!("applying patch under {}", root.display()))?;
    Ok(())
}
