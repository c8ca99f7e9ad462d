mod util;

use usbv5_hid::{CommandReply, FlatMemory, GuestMemory, HidV5Config, IoctlRequest, UsbHidV5};
use util::*;

#[test]
fn get_version_writes_big_endian_version() {
    let (hid, _) = new_hid();
    let mut mem = FlatMemory::new(0x8000);
    let request = IoctlRequest {
        request: IOCTL_GETVERSION,
        buffer_out: OUT_BUF,
        buffer_out_size: 0x20,
        ..IoctlRequest::default()
    };

    assert_eq!(hid.ioctl(&mut mem, &request), CommandReply::SUCCESS);
    assert_eq!(mem.read_bytes(OUT_BUF, 4), vec![0x00, 0x05, 0x00, 0x01]);
}

#[test]
fn attach_finish_succeeds_without_side_effects() {
    let (hid, hooks) = new_hid();
    let mut mem = RecordingMemory::new(0x8000);
    let request = IoctlRequest {
        request: IOCTL_ATTACHFINISH,
        ..IoctlRequest::default()
    };

    assert_eq!(hid.ioctl(&mut mem, &request), CommandReply::SUCCESS);
    assert_eq!(mem.writes, 0);
    assert!(hooks.calls.lock().unwrap().is_empty());
}

#[test]
fn device_change_and_shutdown_are_delegated() {
    let (hid, hooks) = new_hid();
    let mut mem = FlatMemory::new(0x8000);

    let change = hid.ioctl(
        &mut mem,
        &IoctlRequest {
            request: IOCTL_GETDEVICECHANGE,
            ..IoctlRequest::default()
        },
    );
    let shutdown = hid.ioctl(
        &mut mem,
        &IoctlRequest {
            request: IOCTL_SHUTDOWN,
            ..IoctlRequest::default()
        },
    );

    assert_eq!(change, CommandReply::Pending);
    assert_eq!(shutdown, CommandReply::SUCCESS);
    assert_eq!(
        *hooks.calls.lock().unwrap(),
        vec!["device_change", "shutdown"]
    );
}

#[test]
fn unknown_and_alternate_setting_requests_are_unhandled() {
    let (hid, _) = new_hid();
    for request in [7, 4, 5, 0x1234] {
        let mut mem = RecordingMemory::new(0x8000);
        let reply = hid.ioctl(&mut mem, &device_ioctl(request));
        assert_eq!(reply, CommandReply::Unhandled { request });
        assert_eq!(reply.return_value(), Some(0));
        assert_eq!(mem.writes, 0, "request {request}");
    }
}

#[test]
fn unknown_request_logging_is_configurable() {
    let config = HidV5Config::from_json_str(r#"{ "log_unknown_requests": false }"#)
        .expect("config parses");
    assert!(!config.log_unknown_requests);

    let hid = UsbHidV5::new(config, Box::new(RecordingDeviceChange::default())).unwrap();
    let mut mem = FlatMemory::new(0x100);
    assert_eq!(
        hid.ioctl(&mut mem, &device_ioctl(0x99)),
        CommandReply::Unhandled { request: 0x99 }
    );
}

#[test]
fn invalid_configuration_is_rejected() {
    let config = HidV5Config {
        max_devices: 0,
        ..HidV5Config::default()
    };
    let result = UsbHidV5::new(config, Box::new(RecordingDeviceChange::default()));
    assert!(result.is_err());
}

#[test]
fn should_add_device_accepts_hid_interfaces() {
    let (hid, _) = new_hid();
    let host = FakeHost::new(1);
    assert!(hid.should_add_device(host.as_ref()));
}

#[test]
fn suspend_resume_reaches_host_and_succeeds() {
    let (hid, _) = new_hid();
    let host = FakeHost::new(1);
    let handle = attach(&hid, &host, 0);
    let mut mem = FlatMemory::new(0x8000);
    mem.write_u32(IN_BUF, handle.0);

    mem.write_u32(IN_BUF + 8, 0);
    assert_eq!(
        hid.ioctl(&mut mem, &device_ioctl(IOCTL_SUSPEND_RESUME)),
        CommandReply::SUCCESS
    );
    mem.write_u32(IN_BUF + 8, 1);
    assert_eq!(
        hid.ioctl(&mut mem, &device_ioctl(IOCTL_SUSPEND_RESUME)),
        CommandReply::SUCCESS
    );

    assert_eq!(*host.suspended.lock().unwrap(), vec![(0, true), (0, false)]);
}

#[test]
fn suspend_resume_validates_handle() {
    let (hid, _) = new_hid();
    let mut mem = FlatMemory::new(0x8000);
    mem.write_u32(IN_BUF, 0x0001_0005);
    assert_eq!(
        hid.ioctl(&mut mem, &device_ioctl(IOCTL_SUSPEND_RESUME)),
        CommandReply::Reply(-4)
    );
}

#[test]
fn cancel_selectors_map_to_endpoints() {
    let (hid, _) = new_hid();
    let host = FakeHost::new(1);
    let handle = attach(&hid, &host, 0);
    let mut mem = FlatMemory::new(0x8000);
    assert_eq!(
        query_params(&hid, &mut mem, handle, 0),
        CommandReply::SUCCESS
    );

    for selector in [0u32, 1, 2, 0x85] {
        mem.write_u32(IN_BUF, handle.0);
        mem.write_u32(IN_BUF + 8, selector);
        assert_eq!(
            hid.ioctl(&mut mem, &device_ioctl(IOCTL_CANCELENDPOINT)),
            CommandReply::SUCCESS,
            "selector {selector}"
        );
    }

    assert_eq!(*host.canceled.lock().unwrap(), vec![0x00, 0x81, 0x02, 0x85]);
}

#[test]
fn cancel_on_unresolved_endpoint_still_succeeds() {
    let (hid, _) = new_hid();
    let host = FakeHost::new(1);
    let handle = attach(&hid, &host, 0);
    let mut mem = FlatMemory::new(0x8000);
    mem.write_u32(IN_BUF, handle.0);
    mem.write_u32(IN_BUF + 8, 1);

    assert_eq!(
        hid.ioctl(&mut mem, &device_ioctl(IOCTL_CANCELENDPOINT)),
        CommandReply::SUCCESS
    );
    assert!(host.canceled.lock().unwrap().is_empty());
}
