//! Basic usage example for the mesh wire formats.

use bytes::Bytes;
use mesh_crypto::NetworkKeyMaterial;
use mesh_wire::{
    access_payload, decode_network_pdu, encode_network_pdu, proxy, LowerTransportPdu, NetworkPdu,
    Opcode, ProxyPduType, ProxyReassembler, SegmentBuffer, Segmenter,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mesh Wire Format Example ===\n");

    let net_key = [0x7Du8; 16];
    let keys = NetworkKeyMaterial::derive(&net_key);
    let iv_index = 0x0000_0001;

    // 1. Build an access payload and wrap it in an unsegmented lower transport PDU
    println!("1. Building a Generic OnOff Set Unacknowledged payload...");
    let payload = access_payload(Opcode::GENERIC_ONOFF_SET_UNACK, &[0x01, 0x00])?;
    let lower = LowerTransportPdu::UnsegmentedAccess {
        akf: true,
        aid: 0x05,
        upper_pdu: payload,
    };
    let transport_pdu = lower.encode()?;
    println!("   Lower transport PDU: {} bytes", transport_pdu.len());

    // 2. Encode the network PDU
    println!("\n2. Encoding the network PDU...");
    let pdu = NetworkPdu {
        ctl: false,
        ttl: 5,
        seq: 1,
        src: 0x0001,
        dst: 0xC000,
        transport_pdu,
    };
    let encoded = encode_network_pdu(&keys, iv_index, &pdu)?;
    println!("   Encoded network PDU: {} bytes", encoded.len());

    // 3. Decode it again
    println!("\n3. Decoding the network PDU...");
    let decoded = decode_network_pdu(&keys, iv_index, &encoded)?;
    println!("   Source: {:#06x}", decoded.src);
    println!("   Destination: {:#06x}", decoded.dst);
    println!("   Sequence: {}", decoded.seq);

    // 4. Segment a large upper transport PDU
    println!("\n4. Segmenting a 40 byte upper transport PDU...");
    let large = Bytes::from(vec![0x42u8; 40]);
    let segments = Segmenter::new().segment_access(true, 0x05, false, 1, &large)?;
    println!("   Split into {} segments", segments.len());

    let mut buffer = SegmentBuffer::new((segments.len() - 1) as u8)?;
    for segment in segments.into_iter().rev() {
        if let LowerTransportPdu::SegmentedAccess { info, segment, .. } = segment {
            buffer.insert(info.seg_o, segment)?;
        }
    }
    println!("   BlockAck: {:#010x}", buffer.block_ack());
    if let Some(reassembled) = buffer.assemble() {
        println!("   Reassembly successful: {}", reassembled == large);
    }

    // 5. Proxy SAR over a small MTU
    println!("\n5. Proxy segmentation with MTU 20...");
    let pieces = proxy::segment(ProxyPduType::Network, &encoded, 20)?;
    println!("   {} proxy PDUs", pieces.len());
    let mut reassembler = ProxyReassembler::new();
    for piece in &pieces {
        if let Some((pdu_type, message)) = reassembler.push(piece)? {
            println!("   Reassembled {:?} message of {} bytes", pdu_type, message.len());
        }
    }

    println!("\n=== Example completed successfully ===");
    Ok(())
}
