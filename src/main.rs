use anyhow::Result;

fn main() -> Result<()> {
    robocluster::cli::run()
}
