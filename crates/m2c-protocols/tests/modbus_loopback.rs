//! ---
//! m2c_section: "05-networking-external-interfaces"
//! m2c_subsection: "tests"
//! m2c_type: "test"
//! m2c_scope: "code"
//! m2c_description: "Modbus-TCP client against a loopback gateway."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use anyhow::Result;
use m2c_model::{ModbusCommand, ModbusReadSpec};
use m2c_protocols::modbus::frame::adu_len;
use m2c_protocols::modbus::{
    encode_exception, response_value, tag_name, ModbusClient, ReadRequest, ReadResponse,
};
use m2c_protocols::ProtocolError;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Holding registers hold their own address; unit 9 answers with an exception.
async fn spawn_gateway() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        loop {
            let mut frame = vec![0u8; 7];
            if socket.read_exact(&mut frame).await.is_err() {
                return;
            }
            let total = adu_len(&frame).unwrap();
            frame.resize(total, 0);
            socket.read_exact(&mut frame[7..]).await.unwrap();
            let request = ReadRequest::decode(&frame).unwrap();
            let response = if request.unit == 9 {
                encode_exception(&request, 0x02)
            } else if request.command.is_bit_access() {
                ReadResponse::Bits((0..request.count).map(|i| i % 2 == 0).collect()).encode(&request)
            } else {
                ReadResponse::Registers((0..request.count).map(|i| request.address + i).collect())
                    .encode(&request)
            };
            socket.write_all(&response).await.unwrap();
        }
    });
    Ok(port)
}

#[tokio::test]
async fn omitted_count_reads_a_single_register() -> Result<()> {
    let port = spawn_gateway().await?;
    let mut client = ModbusClient::new("127.0.0.1", port);
    client.connect().await?;

    let single = client
        .read(1, ModbusCommand::ReadHoldingRegisters, ModbusReadSpec { address: 40, count: None })
        .await?;
    assert_eq!(single, ReadResponse::Registers(vec![40]));
    assert_eq!(response_value(&single), json!(40));

    let block = client
        .read(1, ModbusCommand::ReadInputRegisters, ModbusReadSpec { address: 7, count: Some(3) })
        .await?;
    assert_eq!(response_value(&block), json!([7, 8, 9]));

    let coils = client
        .read(1, ModbusCommand::ReadCoils, ModbusReadSpec { address: 0, count: Some(3) })
        .await?;
    assert_eq!(response_value(&coils), json!([true, false, true]));
    Ok(())
}

#[tokio::test]
async fn exception_responses_keep_the_session() -> Result<()> {
    let port = spawn_gateway().await?;
    let mut client = ModbusClient::new("127.0.0.1", port);
    client.connect().await?;
    let err = client
        .read(9, ModbusCommand::ReadHoldingRegisters, ModbusReadSpec { address: 0, count: None })
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ModbusException { code: 0x02, .. }));
    assert!(client.is_connected());
    Ok(())
}

#[test]
fn tags_join_host_secondary_command_and_address() {
    assert_eq!(
        tag_name("plant-gw", 3, ModbusCommand::ReadHoldingRegisters, 40),
        "plant-gw.3.readHoldingRegisters.40"
    );
}
