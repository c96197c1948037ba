use std::path::Path;

use airlock::{mount, FileProvider, MountOptions};
use anyhow::{anyhow, bail};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = std::env::args().collect::<Vec<_>>();
    let mut options = MountOptions::default();
    let mut positional = Vec::new();
    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--reserve-mib" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("--reserve-mib needs a value"))?;
                options.reserved_memory = value.parse::<u64>()? * 1024 * 1024;
            }
            _ => positional.push(arg.as_str()),
        }
    }
    let &[source, mount_point] = &positional[..] else {
        bail!("usage: airlockd <source-file> <mount-point> [--reserve-mib N]");
    };

    let mut provider = FileProvider::open(Path::new(source))?;
    mount::run(&mut provider, Path::new(mount_point), &options)
}
