// Property-based tests harness
mod ordering {
    include!("ordering.rs");
}
mod tags {
    include!("tags.rs");
}
mod semaphore {
    include!("semaphore.rs");
}
