//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.
//!
//! Domain names are compressed on the way out (RFC 1035 section
//! 4.1.4): every time a name suffix is written in full its offset is
//! remembered, and later occurrences of the same suffix become a
//! two-octet pointer.

use std::collections::HashMap;

use crate::protocol::types::*;

/// The two high bits marking a compression pointer.
const POINTER_TAG: u16 = 0b1100_0000_0000_0000;

/// The largest buffer offset a 14-bit pointer can refer to.
const POINTER_MAX_OFFSET: usize = 0b0011_1111_1111_1111;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn into_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// Serialise, keeping the result within `max_len` octets.
    ///
    /// If the full message does not fit, records are dropped from the
    /// end (all of additional, then authority, then answers) and the
    /// TC flag is set; the question section is never dropped.
    ///
    /// Returns the octets and whether truncation happened.
    pub fn into_octets_bounded(self, max_len: usize) -> Result<(Vec<u8>, bool), Error> {
        let octets = self.clone().into_octets()?;
        if octets.len() <= max_len {
            return Ok((octets, false));
        }

        let mut message = self;
        message.header.is_truncated = true;
        message.additional.clear();

        loop {
            let octets = message.clone().into_octets()?;
            if octets.len() <= max_len {
                return Ok((octets, true));
            }
            if message.authority.pop().is_none() && message.answers.pop().is_none() {
                // only the header and question remain
                return Ok((octets, true));
            }
        }
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for rr in self.answers {
            rr.serialise(buffer)?;
        }
        for rr in self.authority {
            rr.serialise(buffer)?;
        }
        for rr in self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & u8::from(self.rcode);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        self.rtype_with_data.rtype().serialise(buffer);
        self.rclass.serialise(buffer);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer);
                rname.serialise(buffer);
                buffer.write_u32(serial);
                buffer.write_u32(refresh);
                buffer.write_u32(retry);
                buffer.write_u32(expire);
                buffer.write_u32(minimum);
            }
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer),
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(preference);
                exchange.serialise(buffer);
            }
            RecordTypeWithData::TXT { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(priority);
                buffer.write_u16(weight);
                buffer.write_u16(port);
                // RFC 2782: the target must not be compressed
                target.serialise_uncompressed(buffer);
            }
            RecordTypeWithData::OPT { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(&octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Write the name, substituting a pointer for any suffix that has
    /// already appeared in the buffer.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        for (i, label) in self.labels.iter().enumerate() {
            if label.is_empty() {
                buffer.write_u8(0);
                return;
            }

            let suffix = wire_octets(&self.labels[i..]);
            if let Some(offset) = buffer.known_name_offset(&suffix) {
                buffer.write_u16(POINTER_TAG | offset);
                return;
            }

            buffer.remember_name(suffix);
            buffer.write_u8(label.len());
            buffer.write_octets(label.octets());
        }
    }

    /// Write the name in full, neither emitting nor recording
    /// pointers.
    pub fn serialise_uncompressed(self, buffer: &mut WritableBuffer) {
        buffer.write_octets(&self.octets);
    }
}

/// The uncompressed wire encoding of a run of labels.
fn wire_octets(labels: &[Label]) -> Vec<u8> {
    let mut octets = Vec::with_capacity(DOMAINNAME_MAX_LEN);
    for label in labels {
        octets.push(label.len());
        octets.extend_from_slice(label.octets());
    }
    octets
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which can be written to, for serialisation purposes.
/// Tracks where name suffixes were written so later names can point
/// at them.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
    name_offsets: HashMap<Vec<u8>, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
            name_offsets: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    fn known_name_offset(&self, suffix: &[u8]) -> Option<u16> {
        self.name_offsets.get(suffix).copied()
    }

    fn remember_name(&mut self, suffix: Vec<u8>) {
        // offsets past the pointer range can't be referred to
        if self.octets.len() <= POINTER_MAX_OFFSET {
            #[allow(clippy::cast_possible_truncation)]
            let offset = self.octets.len() as u16;
            self.name_offsets.entry(suffix).or_insert(offset);
        }
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.extend_from_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    u16::try_from(counter).map_err(|_| Error::CounterTooLarge {
        counter,
        bits: u16::BITS,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let rr = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::MX {
                preference: 32,
                exchange: domain("mx.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let _ = rr.serialise(&mut buf);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0000_1111, // MX
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0000_0111, // 7 octets: preference + "mx" + pointer
                // RDATA
                0, 32, // preference
                2, 109, 120, // "mx"
                0b1100_0000, 8, // pointer to "example.com." at offset 8
            ],
            buf.octets,
        );
    }

    #[test]
    fn compression_points_at_first_occurrence() {
        let name = domain("www.example.com.");
        let mut buf = WritableBuffer::default();
        name.clone().serialise(&mut buf);
        let first_len = buf.octets.len();
        name.serialise(&mut buf);

        // the whole second occurrence collapses to one pointer
        assert_eq!(first_len + 2, buf.octets.len());
        assert_eq!(
            vec![0b1100_0000, 0],
            buf.octets[first_len..first_len + 2].to_vec()
        );
    }

    #[test]
    fn compression_shares_suffixes() {
        let mut buf = WritableBuffer::default();
        domain("www.example.com.").serialise(&mut buf);
        let first_len = buf.octets.len();
        domain("mail.example.com.").serialise(&mut buf);

        // "mail" written in full, then a pointer to "example.com." at
        // offset 4 (after the "www" label)
        assert_eq!(
            vec![4, 109, 97, 105, 108, 0b1100_0000, 4],
            buf.octets[first_len..].to_vec()
        );
    }

    #[test]
    fn root_name_is_never_compressed() {
        let mut buf = WritableBuffer::default();
        DomainName::root_domain().serialise(&mut buf);
        DomainName::root_domain().serialise(&mut buf);

        assert_eq!(vec![0, 0], buf.octets);
    }

    #[test]
    fn bounded_serialise_is_identity_when_it_fits() {
        let query = Message::from_question(1, question("example.com.", RecordType::A));
        let mut response = query.make_response();
        response
            .answers
            .push(a_record("example.com.", Ipv4Addr::new(93, 184, 216, 34)));

        let full = response.clone().into_octets().unwrap();
        let (bounded, truncated) = response.into_octets_bounded(512).unwrap();

        assert!(!truncated);
        assert_eq!(full, bounded);
    }

    #[test]
    fn bounded_serialise_drops_answers_and_sets_tc() {
        let query = Message::from_question(1, question("big.example.", RecordType::TXT));
        let mut response = query.make_response();
        response
            .answers
            .push(txt_record("big.example.", &[b'x'; 1400]));

        let (octets, truncated) = response.into_octets_bounded(512).unwrap();

        assert!(truncated);
        assert!(octets.len() <= 512);
        // TC bit set
        assert_eq!(HEADER_MASK_TC, octets[2] & HEADER_MASK_TC);
        // question section intact, answer gone
        let parsed = Message::from_octets(&octets).unwrap();
        assert_eq!(1, parsed.questions.len());
        assert!(parsed.answers.is_empty());
        assert!(parsed.header.is_truncated);
    }
}
