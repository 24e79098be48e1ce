fn main() -> anyhow::Result<()> {
    brrtpipe::cli::run_cli()
}
