//! End-to-end engine tests against the simulated slave in `common`.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{engine, warning_sink, Fault, SimDevice};
use modbus_engine::{
    AddressHeader, BatchKey, BlockingEngine, DataFormat, DataType, DeviceLimits, EngineConfig,
    Framing, ModbusEngine, ModbusError, ModbusValue,
};

/// Address and quantity fields of a TCP read request.
fn tcp_read_span(request: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([request[8], request[9]]),
        u16::from_be_bytes([request[10], request[11]]),
    )
}

#[tokio::test]
async fn float_written_with_fc16_reads_back() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());

    let written = engine.write::<f32>("1;16;100", &[3.14]).await;
    assert!(written.success, "{:?}", written.error);
    assert_eq!(device.holding(100, 2), vec![0x4048, 0xF5C3]);
    assert_eq!(device.requests.lock().unwrap()[0][7], 0x10);

    let read = engine.read_one::<f32>("1;3;100").await;
    assert!(read.success, "{:?}", read.error);
    assert!((read.value.unwrap() - 3.14).abs() < 1e-6);
    assert_eq!(read.request_trace.len(), 1);
    assert_eq!(read.response_trace.len(), 1);
}

#[tokio::test]
async fn batch_coalesces_into_two_windows() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());
    device.set_holding(0, &[0xFFFE]);
    device.set_holding(5, &[0x3FC0, 0x0000]);
    device.set_holding(200, &[42]);

    let result = engine
        .read_batch(&[
            ("1;3;0", DataType::Int16),
            ("1;3;5", DataType::Float),
            ("1;3;200", DataType::UInt16),
        ])
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.request_trace.len(), 2);
    assert_eq!(result.response_trace.len(), 2);

    let requests = device.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(tcp_read_span(&requests[0]), (0, 7));
    assert_eq!(tcp_read_span(&requests[1]), (200, 1));

    let values = result.value.unwrap();
    assert_eq!(values.len(), 3);
    assert_eq!(values[&BatchKey::new(1, 3, 0)], ModbusValue::Int16(-2));
    assert_eq!(values[&BatchKey::new(1, 3, 5)], ModbusValue::Float(1.5));
    assert_eq!(values[&BatchKey::new(1, 3, 200)], ModbusValue::UInt16(42));
}

#[tokio::test]
async fn batch_values_match_individual_reads() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());
    let words: Vec<u16> = (0..60).map(|i| i * 1_000 + 7).collect();
    device.set_holding(10, &words);
    device.set_coils(3, &[true, false, false, true]);

    let points = [
        ("1;3;10", DataType::UInt16),
        ("1;3;11", DataType::Int32),
        ("1;3;20", DataType::Double),
        ("1;3;31", DataType::Float),
        ("1;3;69", DataType::Int16),
        ("1;1;3", DataType::Bool),
        ("1;1;6", DataType::Bool),
    ];
    let batch = engine.read_batch(&points).await.into_result().unwrap();

    for (text, data_type) in points {
        let single = engine.read_value(text, data_type).await;
        assert!(single.success, "{}: {:?}", text, single.error);
        let header = AddressHeader::parse(text).unwrap();
        assert_eq!(batch[&BatchKey::from(&header)], single.value.unwrap(), "{}", text);
    }
}

#[tokio::test]
async fn batch_bit_points_match_read_bool() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());
    device.set_holding(10, &[0x0001]);

    let points = [
        ("1;3;10.3", DataType::Bool),
        ("1;3;10.0", DataType::Bool),
        ("1;3;10", DataType::UInt16),
    ];
    let batch = engine.read_batch(&points).await.into_result().unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(device.request_count(), 1);

    let bit3 = BatchKey::from(&AddressHeader::parse("1;3;10.3").unwrap());
    let bit0 = BatchKey::from(&AddressHeader::parse("1;3;10.0").unwrap());
    assert_eq!(batch[&bit3], ModbusValue::Bool(false));
    assert_eq!(batch[&bit0], ModbusValue::Bool(true));
    assert_eq!(batch[&BatchKey::new(1, 3, 10)], ModbusValue::UInt16(1));

    for text in ["1;3;10.3", "1;3;10.0"] {
        let single = engine.read_bool(text, 1).await.into_result().unwrap();
        let header = AddressHeader::parse(text).unwrap();
        assert_eq!(batch[&BatchKey::from(&header)], ModbusValue::Bool(single[0]), "{}", text);
    }
}

#[tokio::test]
async fn typed_reads_reject_bit_addresses() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());

    let scalar = engine.read_one::<u16>("1;3;10.15").await;
    assert!(matches!(scalar.error, Some(ModbusError::Configuration { .. })));

    let value = engine.read_value("1;4;10.2", DataType::Int32).await;
    assert!(matches!(value.error, Some(ModbusError::Configuration { .. })));

    let typed_bit = engine.read_batch(&[("1;3;10.1", DataType::UInt16)]).await;
    assert!(matches!(typed_bit.error, Some(ModbusError::Configuration { .. })));

    assert_eq!(device.request_count(), 0);
}

#[tokio::test]
async fn exception_maps_to_illegal_data_address() {
    let (engine, _device) = engine(Framing::Tcp, EngineConfig::default());

    let result = engine.read_one::<u16>("1;3;20000").await;
    assert!(!result.success);
    assert_eq!(result.exception(), Some(0x02));
    assert_eq!(result.error_code(), Some(2));
    assert!(result
        .message()
        .unwrap()
        .to_lowercase()
        .contains("illegal data address"));
    assert_eq!(result.response_trace.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_interleave() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());
    let words: Vec<u16> = (0..64).collect();
    device.set_holding(0, &words);
    let engine = Arc::new(engine);

    let mut tasks = Vec::new();
    for task in 0..16u16 {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            for round in 0..10u16 {
                let address = (task * 3 + round) % 64;
                let result = engine.read_one::<u16>(format!("1;3;{}", address)).await;
                assert_eq!(result.value, Some(address), "{:?}", result.error);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(!device.was_interleaved());
    assert_eq!(device.request_count(), 160);
    let stats = engine.stats().await;
    assert_eq!(stats.requests_sent, 160);
    assert_eq!(stats.responses_received, 160);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn rtu_retries_once_after_lost_frame() {
    let (engine, device) = engine(Framing::Rtu, EngineConfig::default());
    device.set_holding(7, &[0x1234]);
    device.inject(Fault::Drop);

    let result = engine.read_one::<u16>("2;3;7").await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.value, Some(0x1234));
    assert_eq!(device.request_count(), 2);
    assert_eq!(result.request_trace.len(), 2);
    assert_eq!(result.response_trace.len(), 1);
}

#[tokio::test]
async fn rtu_surfaces_second_failure() {
    let (engine, device) = engine(Framing::Rtu, EngineConfig::default());
    device.inject(Fault::Drop);
    device.inject(Fault::CorruptCrc);

    let result = engine.read_one::<u16>("2;3;7").await;
    assert!(matches!(result.error, Some(ModbusError::CrcMismatch { .. })));
    assert_eq!(device.request_count(), 2);

    // the next call starts fresh
    assert!(engine.read_one::<u16>("2;3;7").await.success);
}

#[tokio::test]
async fn rtu_exception_is_not_retried() {
    let (engine, device) = engine(Framing::Rtu, EngineConfig::default());
    device.inject(Fault::Exception(0x04));

    let result = engine.write_single_register(1, 0, 9).await;
    assert_eq!(result.exception(), Some(0x04));
    assert_eq!(device.request_count(), 1);
}

#[tokio::test]
async fn lenient_crc_decodes_and_warns() {
    let (callback, warnings) = warning_sink();
    let (device, state) = SimDevice::new(Framing::Rtu);
    let engine = ModbusEngine::new(device, EngineConfig::default().with_strict_crc(false))
        .unwrap()
        .with_log_callback(callback);
    state.set_holding(1, &[77]);
    state.inject(Fault::CorruptCrc);

    let result = engine.read_one::<u16>("1;3;1").await;
    assert_eq!(result.value, Some(77));
    assert_eq!(state.request_count(), 1);
    assert_eq!(warnings.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn tcp_stale_check_head_fails_without_local_retry() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());
    device.inject(Fault::StaleCheckHead);

    let result = engine.read_one::<u16>("1;3;0").await;
    assert!(matches!(
        result.error,
        Some(ModbusError::CheckHeadMismatch { .. })
    ));
    assert_eq!(device.request_count(), 1);
    assert!(!engine.is_connected().await);

    assert!(engine.read_one::<u16>("1;3;0").await.success);
    assert_eq!(device.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn batch_retry_warns_and_accumulates_traces() {
    let (callback, warnings) = warning_sink();
    let (device, state) = SimDevice::new(Framing::Tcp);
    let engine = ModbusEngine::new(device, EngineConfig::default().with_retry_count(2))
        .unwrap()
        .with_log_callback(callback);
    state.set_holding(40, &[5]);
    state.inject(Fault::StaleCheckHead);

    let result = engine.read_batch(&[("1;3;40", DataType::UInt16)]).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.request_trace.len(), 2);
    assert_eq!(result.response_trace.len(), 2);
    assert_eq!(warnings.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn batch_gives_up_after_retry_count() {
    let (callback, warnings) = warning_sink();
    let (device, state) = SimDevice::new(Framing::Tcp);
    let engine = ModbusEngine::new(device, EngineConfig::default().with_retry_count(1))
        .unwrap()
        .with_log_callback(callback);
    state.inject(Fault::Drop);
    state.inject(Fault::Drop);

    let result = engine.read_batch(&[("1;3;40", DataType::UInt16)]).await;
    assert!(!result.success);
    assert_eq!(result.error_code(), Some(408));
    assert_eq!(result.request_trace.len(), 2);
    assert_eq!(warnings.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn batch_rejects_bad_input_before_io() {
    let (engine, device) = engine(
        Framing::Tcp,
        EngineConfig::default().with_retry_count(3),
    );

    let parsed = engine
        .read_batch(&[("1;3;0", DataType::UInt16), ("abc;3;100", DataType::UInt16)])
        .await;
    assert!(matches!(parsed.error, Some(ModbusError::Parse { .. })));

    let typed = engine.read_batch(&[("1;2;0", DataType::Int32)]).await;
    assert!(matches!(typed.error, Some(ModbusError::Configuration { .. })));

    assert_eq!(device.request_count(), 0);
}

#[tokio::test]
async fn large_reads_are_chunked() {
    let limits = DeviceLimits::new().with_max_read_registers(10);
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default().with_limits(limits));
    let words: Vec<u16> = (100..125).collect();
    device.set_holding(0, &words);

    let result = engine.read::<u16>("1;3;0", 25).await;
    assert_eq!(result.value, Some(words));
    let requests = device.requests.lock().unwrap().clone();
    let spans: Vec<(u16, u16)> = requests.iter().map(|r| tcp_read_span(r)).collect();
    assert_eq!(spans, vec![(0, 10), (10, 10), (20, 5)]);
    assert_eq!(result.request_trace.len(), 3);
}

#[tokio::test]
async fn register_bits_follow_bit_order() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());
    device.set_holding(10, &[0b1000_0000_0000_0101, 0x0001]);

    let low = engine.read_bool("1;3;10.0", 3).await;
    assert_eq!(low.value, Some(vec![true, false, true]));

    let spanning = engine.read_bool("1;3;10.15", 2).await;
    assert_eq!(spanning.value, Some(vec![true, true]));
    let last = device.requests.lock().unwrap().last().cloned().unwrap();
    assert_eq!(tcp_read_span(&last), (10, 2));

    let header = AddressHeader::parse("1;3;10.0")
        .unwrap()
        .with_bit_from_left(true);
    assert_eq!(engine.read_bool(header, 1).await.value, Some(vec![true]));

    let whole = engine.read_value("1;3;11", DataType::Bool).await;
    assert_eq!(whole.value, Some(ModbusValue::Bool(true)));
}

#[tokio::test]
async fn coil_writes_pick_single_or_multiple() {
    let (engine, device) = engine(Framing::Tcp, EngineConfig::default());

    assert!(engine.write_single_coil(1, 0, true).await.success);
    assert!(engine
        .write_multiple_coils(1, 3, &[true, false, true, true])
        .await
        .success);
    {
        let requests = device.requests.lock().unwrap();
        assert_eq!(requests[0][7], 0x05);
        assert_eq!(requests[1][7], 0x0F);
    }
    assert_eq!(device.coils(0, 1), vec![true]);
    assert_eq!(device.coils(3, 4), vec![true, false, true, true]);

    let read = engine.read_coils(1, 3, 4).await;
    assert_eq!(read.value, Some(vec![true, false, true, true]));
}

#[tokio::test]
async fn register_aliases_round_trip() {
    let (engine, device) = engine(Framing::Rtu, EngineConfig::default());
    device.set_input(50, &[11, 12]);

    assert!(engine
        .write_multiple_registers(3, 20, &[1, 2, 3])
        .await
        .success);
    assert_eq!(
        engine.read_holding_registers(3, 20, 3).await.value,
        Some(vec![1, 2, 3])
    );
    assert_eq!(
        engine.read_input_registers(3, 50, 2).await.value,
        Some(vec![11, 12])
    );
    assert_eq!(engine.read_discrete_inputs(3, 0, 2).await.value, Some(vec![false, false]));
}

#[tokio::test]
async fn data_format_controls_wire_order() {
    let config = EngineConfig::default().with_data_format(DataFormat::CDAB);
    let (engine, device) = engine(Framing::Tcp, config);

    assert!(engine.write::<u32>("1;16;0", &[0x1122_3344]).await.success);
    assert_eq!(device.holding(0, 2), vec![0x3344, 0x1122]);

    let value = ModbusValue::Double(-12.625);
    assert!(engine.write_value("1;16;8", &value).await.success);
    assert_eq!(
        engine.read_value("1;3;8", DataType::Double).await.value,
        Some(value)
    );
}

#[tokio::test]
async fn non_persistent_connection_reconnects_per_exchange() {
    let config = EngineConfig::default().with_persistent_connection(false);
    let (engine, device) = engine(Framing::Tcp, config);

    assert!(engine.read_one::<u16>("1;3;0").await.success);
    assert!(engine.read_one::<u16>("1;3;1").await.success);
    assert!(!engine.is_connected().await);
    assert_eq!(device.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn blocking_engine_shares_the_same_exchange_path() {
    let (engine, device) = engine(Framing::Rtu, EngineConfig::default());
    let blocking = BlockingEngine::new(engine).unwrap();

    assert!(blocking.connect().success);
    assert!(blocking.write::<i32>("4;16;30", &[-70_000]).success);
    assert_eq!(blocking.read_one::<i32>("4;3;30").value, Some(-70_000));
    assert_eq!(device.request_count(), 2);
    assert_eq!(blocking.stats().requests_sent, 2);
}
