use cuda_api::driver::LIB_PATH_ENV;
use cuda_api::Error;
use cuda_api::Runtime;
use similar_asserts::assert_eq;

// Only test in this binary: it sets a process-wide environment variable.
#[test]
fn runtime_without_driver_library_is_an_error() {
    std::env::set_var(LIB_PATH_ENV, "/nonexistent/cuda/libcuda.so.1");

    let result = std::panic::catch_unwind(Runtime::new);

    let Ok(Err(err)) = result else {
        panic!("Runtime::new must fail without panicking when the library is missing");
    };
    let Error::LibraryLoad { path, .. } = &err else {
        panic!("expected a load failure, got {err:?}");
    };
    assert_eq!(path, "/nonexistent/cuda/libcuda.so.1");
}
