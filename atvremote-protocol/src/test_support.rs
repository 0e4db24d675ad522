//! Shared fixtures for unit tests

pub const CLIENT_DER: &[u8] = include_bytes!("../tests/fixtures/client_cert.der");
pub const SERVER_DER: &[u8] = include_bytes!("../tests/fixtures/server_cert.der");

/// ServerHello and Certificate records as a TV pairing port sends them
pub fn certificate_flight(der: &[u8]) -> Vec<u8> {
    fn record(body: &[u8]) -> Vec<u8> {
        let mut out = vec![22, 0x03, 0x03];
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    let entry_len = (der.len() as u32).to_be_bytes();
    let list_len = (der.len() as u32 + 3).to_be_bytes();
    let message_len = (der.len() as u32 + 6).to_be_bytes();

    let mut certificate = vec![11];
    certificate.extend_from_slice(&message_len[1..]);
    certificate.extend_from_slice(&list_len[1..]);
    certificate.extend_from_slice(&entry_len[1..]);
    certificate.extend_from_slice(der);

    let mut flight = record(&[2, 0x00, 0x00, 0x02, 0x03, 0x03]);
    flight.extend(record(&certificate));
    flight
}
