fn main() {
    uniffi::generate_scaffolding("src/huddle.udl").unwrap();
}
