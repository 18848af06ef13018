//! Resolve `getpid(2)` from the current process and call it through
//! natcall, dynamically and through the compiled trampoline when the
//! host gets one.

#[cfg(unix)]
fn main() -> Result<(), natcall::Error> {
    use natcall::types::CallingConvention;
    use natcall::{Callable, Library, NativeType, ResultType, Signature};

    let libc = Library::current()?;
    let sig = Signature::new(
        ResultType::new(NativeType::SInt),
        vec![],
        CallingConvention::Default,
    );
    let getpid = Callable::bind_symbol(&libc, "getpid", &sig, false)?;

    println!(
        "bound getpid via the {} path",
        if getpid.is_compiled() { "compiled stub" } else { "generic" }
    );

    let pid = getpid.invoke(vec![])?.as_i32();
    println!("getpid() = {pid}");

    if let Some(entry) = getpid.code_ptr() {
        type GetpidStub =
            extern "C" fn(*mut std::ffi::c_void, *mut std::ffi::c_void) -> i32;
        let f: GetpidStub = unsafe { std::mem::transmute(entry.as_ptr()) };
        println!(
            "through the trampoline: {}",
            f(std::ptr::null_mut(), std::ptr::null_mut())
        );
    }

    Ok(())
}

#[cfg(not(unix))]
fn main() {
    eprintln!("this example resolves getpid from libc; unix only");
}
