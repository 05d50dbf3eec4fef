fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo::rerun-if-env-changed=FABRICLAB_VERSION");
    Ok(())
}
