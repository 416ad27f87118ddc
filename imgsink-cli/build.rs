use vergen::EmitBuilder;

fn main() {
    // Generate the default 'cargo:' instruction output
    EmitBuilder::builder().all_cargo().emit().unwrap();
}
