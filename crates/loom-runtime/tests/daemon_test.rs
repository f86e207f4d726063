//! The daemon thread against a hand-driven controller socket.

use std::net::{TcpListener, TcpStream};

use loom_config::testing::TestEnvironment;
use loom_ipc::{read_frame, write_frame, Hello};
use loom_runtime::{Runtime, TcpConnector};

/// Call site the test thread reports while it waits on the socket, so the
/// daemon can evacuate the process meanwhile.
const WAIT_SITE: u32 = 0;

fn request(stream: &mut TcpStream, line: &str) -> String {
    write_frame(stream, line).unwrap();
    read_frame(stream).unwrap().expect("daemon closed the connection")
}

fn accept_daemon(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().unwrap();
    let hello: Hello = read_frame(&mut stream).unwrap().unwrap().parse().unwrap();
    assert_eq!(
        hello,
        Hello::Daemon {
            pid: std::process::id()
        }
    );
    stream
}

#[test]
fn daemon_applies_controller_commands() {
    let env = TestEnvironment::new().unwrap();
    let listener = TcpListener::bind(env.controller_addr()).unwrap();
    let filter = env.write_filter("cs.filter", "1 2 0 42 1 43 1 2 0 0").unwrap();

    let config = env.config();
    let rt = Runtime::new(&config.engine, Box::new(TcpConnector::new(&config)));
    rt.on_process_start().unwrap();
    let c = rt.coordinator();

    c.before_blocking(WAIT_SITE);
    let mut stream = accept_daemon(&listener);
    assert_eq!(
        request(&mut stream, &format!("add 7 {}", filter.display())),
        "OK"
    );
    assert_eq!(
        request(&mut stream, "ls"),
        "ID\ttype\tops\tfuncs\n7\tcritical_region\t2\t1"
    );
    let dup = request(&mut stream, &format!("add 7 {}", filter.display()));
    assert!(dup.starts_with("failed to add the filter"), "{}", dup);
    c.after_blocking(WAIT_SITE);

    assert!(rt.is_patched(2));
    assert_eq!(rt.state().registry().len(), 2);
    rt.dispatch(42);
    rt.dispatch(43);

    c.before_blocking(WAIT_SITE);
    assert_eq!(request(&mut stream, "del 7"), "OK");
    assert!(request(&mut stream, "del 7").starts_with("failed to delete the filter"));
    assert_eq!(request(&mut stream, "bogus"), "unknown command: bogus");
    c.after_blocking(WAIT_SITE);

    assert!(rt.state().registry().is_empty());
    rt.on_process_exit();

    // The daemon hangs up when the process exits
    assert!(read_frame(&mut stream).map(|f| f.is_none()).unwrap_or(true));
}

#[test]
fn daemon_reconnects_after_controller_restart() {
    let env = TestEnvironment::new().unwrap();
    let listener = TcpListener::bind(env.controller_addr()).unwrap();

    let config = env.config();
    let rt = Runtime::new(&config.engine, Box::new(TcpConnector::new(&config)));
    rt.on_process_start().unwrap();
    let c = rt.coordinator();

    c.before_blocking(WAIT_SITE);
    let first = accept_daemon(&listener);
    drop(first);
    let mut second = accept_daemon(&listener);
    assert_eq!(request(&mut second, "ls"), "ID\ttype\tops\tfuncs");
    c.after_blocking(WAIT_SITE);

    rt.on_process_exit();
}

#[test]
fn filters_left_at_exit_are_reported() {
    let env = TestEnvironment::new().unwrap();
    let listener = TcpListener::bind(env.controller_addr()).unwrap();
    let filter = env.write_filter("order.filter", "2 2 0 3 1 4").unwrap();

    let config = env.config();
    let rt = Runtime::new(&config.engine, Box::new(TcpConnector::new(&config)));
    rt.on_process_start().unwrap();
    let c = rt.coordinator();

    c.before_blocking(WAIT_SITE);
    let mut stream = accept_daemon(&listener);
    assert_eq!(
        request(&mut stream, &format!("add 1 {}", filter.display())),
        "OK"
    );
    c.after_blocking(WAIT_SITE);

    assert_eq!(rt.shutdown(), vec![1]);
    // The daemon is gone and nothing was evacuated
    assert!(read_frame(&mut stream).map(|f| f.is_none()).unwrap_or(true));
    assert_eq!(rt.state().registry().len(), 2);

    rt.manager().remove(1).unwrap();
    assert!(rt.state().registry().is_empty());
}
