fn main() -> anyhow::Result<()> {
    netguard_helper::run()
}
