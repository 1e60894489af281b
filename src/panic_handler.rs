use std::panic;

use log::error;

/// Install `better_panic` and a hook that records the panic in the log
/// file before the default report is printed.
pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        match panic_info.location() {
            Some(location) => error!(
                "Thread '{name}' panicked at {}:{}: {}",
                location.file(),
                location.line(),
                panic_message(panic_info)
            ),
            None => error!("Thread '{name}' panicked: {}", panic_message(panic_info)),
        }
        log::logger().flush();

        default_hook(panic_info);
    }));
}

fn panic_message(panic_info: &panic::PanicHookInfo<'_>) -> String {
    let payload = panic_info.payload();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
