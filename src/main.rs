fn main() -> std::io::Result<()> {
    lancall_lib::run()
}
