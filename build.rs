fn main() {
    // ESP-IDF environment is only needed for espidf targets (xtensa or riscv);
    // host builds and tests skip it
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
