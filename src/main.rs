fn main() -> anyhow::Result<()> {
    trial_gateway_lib::run()
}
