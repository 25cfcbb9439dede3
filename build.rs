// build.rs

fn main() {
    // Embed the crate version and (if available) the git commit into the
    // binary so that diagnostic dumps (see `crate::error::dump_fatal_state`)
    // can report exactly what was running.
    built::write_built_file().expect("failed to acquire build-time information");
}
