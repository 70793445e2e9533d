use anyhow::Result;

pub fn run() -> Result<()> {
    println!("infergate {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
