use criterion::{Criterion, criterion_group, criterion_main};
use wiimoted::buttons::{ButtonState, ButtonTracker};
use wiimoted::{AccelCalibration, AccelSample, DeviceSession, InputReport, SessionSettings};
use wiimoted::{Transport, TransportError};

/// Transport that accepts every packet and never has anything to read
struct NullTransport;

impl Transport for NullTransport {
    type Handle = u8;

    fn discover(&mut self, found: &mut dyn FnMut(u8)) -> Result<(), TransportError> {
        found(0);
        Ok(())
    }

    fn send(&mut self, _handle: u8, _packet: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn receive(&mut self, _handle: u8, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn disconnect(&mut self, _handle: u8) {}
}

fn accel_ext16_packet(buttons: u16) -> Vec<u8> {
    let mut packet = vec![0xA1, 0x35, (buttons & 0xFF) as u8, (buttons >> 8) as u8, 0x80, 0x7E, 0x99];
    packet.extend_from_slice(&[0u8; 16]);
    packet
}

fn benchmark_report_parse(c: &mut Criterion) {
    let buttons = [0xA1u8, 0x30, 0x08, 0x80];
    let accel_ext = accel_ext16_packet(0x0810);
    let status = [0xA1u8, 0x20, 0x00, 0x00, 0x12, 0x00, 0x00, 0xC8];

    c.bench_function("InputReport parse buttons", |b| {
        b.iter(|| std::hint::black_box(InputReport::parse(std::hint::black_box(&buttons)).ok()));
    });

    c.bench_function("InputReport parse accel ext16", |b| {
        b.iter(|| std::hint::black_box(InputReport::parse(std::hint::black_box(&accel_ext)).ok()));
    });

    c.bench_function("InputReport parse status", |b| {
        b.iter(|| std::hint::black_box(InputReport::parse(std::hint::black_box(&status)).ok()));
    });
}

fn benchmark_buttons(c: &mut Criterion) {
    c.bench_function("ButtonTracker update and drain", |b| {
        let mut tracker = ButtonTracker::new();
        tracker.update(ButtonState::empty());
        let mut toggle = false;
        b.iter(|| {
            toggle = !toggle;
            let state = if toggle {
                ButtonState::A | ButtonState::HOME | ButtonState::UP
            } else {
                ButtonState::empty()
            };
            tracker.update(std::hint::black_box(state));
            while let Some(event) = tracker.next_event() {
                std::hint::black_box(event);
            }
        });
    });
}

fn benchmark_accel(c: &mut Criterion) {
    let calibration = AccelCalibration::parse(&[0x80, 0x80, 0x80, 0x00, 0x9A, 0x9A, 0x9A, 0x00, 0x00, 0xA3])
        .ok();

    c.bench_function("AccelSample from_report", |b| {
        b.iter(|| {
            std::hint::black_box(AccelSample::from_report(
                std::hint::black_box([0x60, 0x60]),
                std::hint::black_box([0x80, 0x7E, 0x99]),
            ))
        });
    });

    if let Some(calibration) = calibration {
        let sample = AccelSample::from_report([0x60, 0x60], [0x80, 0x7E, 0x99]);
        c.bench_function("AccelCalibration apply", |b| {
            b.iter(|| std::hint::black_box(calibration.apply(std::hint::black_box(&sample))));
        });
    }
}

fn benchmark_session_dispatch(c: &mut Criterion) {
    let pressed = accel_ext16_packet(0x0008);
    let released = accel_ext16_packet(0x0000);

    c.bench_function("DeviceSession dispatch and drain", |b| {
        let mut transport = NullTransport;
        let mut session = DeviceSession::new(0u8, 1, SessionSettings::default());
        let mut toggle = false;
        b.iter(|| {
            toggle = !toggle;
            let packet = if toggle { &pressed } else { &released };
            let _ = session.dispatch(&mut transport, std::hint::black_box(packet));
            while let Some(event) = session.next_event() {
                std::hint::black_box(event);
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_report_parse,
    benchmark_buttons,
    benchmark_accel,
    benchmark_session_dispatch
);
criterion_main!(benches);
