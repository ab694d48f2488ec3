fn main() -> anyhow::Result<()> {
    lanlink_lib::run()
}
