use std::{io::Write, time::Duration};

use eventflux::{BatchSize, ConsumerOptions, Ordering, ProducerOptions, config::Config};
use serial_test::serial;

const CONFIG: &str = r#"
name = "eventflux"
version = 1

[producer]
batch_size = 32
ordering = "loose"
thread_count = 3
max_idle_ms = 20

[consumer]
batch_size = "adaptive"
thread_count = 2
check_data = true

[logging]
level = "debug"
"#;

#[test]
#[serial]
fn initialize_reads_the_configured_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(CONFIG.as_bytes()).expect("write config");
    // SAFETY: serialized with the other tests in this binary.
    unsafe { std::env::set_var(eventflux::CONFIG_ENV, file.path()) };

    let conf = eventflux::initialize();
    assert_eq!(conf.logging.level, "debug");

    let producer = ProducerOptions::from(&conf.producer);
    assert_eq!(producer.batch_size, BatchSize::Fixed(32));
    assert_eq!(producer.ordering, Ordering::Loose);
    assert_eq!(producer.thread_count, 3);
    assert_eq!(producer.max_idle, Duration::from_millis(20));

    let consumer = ConsumerOptions::from(&conf.consumer);
    assert_eq!(consumer.batch_size, BatchSize::Adaptive);
    assert!(consumer.check_data);
    assert!(consumer.targets.is_none());

    // Later loads return the stored configuration.
    assert!(std::ptr::eq(conf, eventflux::load_config().expect("cached")));
}

#[test]
#[serial]
fn invalid_files_are_reported() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"[producer]\nbatch_size = 0\n").expect("write config");
    assert!(Config::from_file(file.path()).is_err());
}
