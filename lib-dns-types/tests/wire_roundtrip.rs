use fake::{Fake, Faker};

use dns_types::protocol::deserialise::ConsumableBuffer;
use dns_types::protocol::serialise::WritableBuffer;
use dns_types::protocol::types::*;

#[test]
fn roundtrip_message() {
    for _ in 0..100 {
        let original = arbitrary_message();
        let deserialised = Message::from_octets(&original.clone().into_octets().unwrap());

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_message_bounded_without_truncation() {
    for _ in 0..100 {
        let original = arbitrary_message();
        let (octets, truncated) = original.clone().into_octets_bounded(65535).unwrap();

        assert!(!truncated);
        assert_eq!(Ok(original), Message::from_octets(&octets));
    }
}

#[test]
fn roundtrip_question() {
    for _ in 0..100 {
        let original = arbitrary_question();

        let mut buffer = WritableBuffer::default();
        original.clone().serialise(&mut buffer);
        let deserialised = Question::deserialise(0, &mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_resourcerecord() {
    for _ in 0..100 {
        let original = arbitrary_resourcerecord();

        let mut buffer = WritableBuffer::default();
        original.clone().serialise(&mut buffer).unwrap();
        let deserialised =
            ResourceRecord::deserialise(0, &mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_domainname() {
    for _ in 0..100 {
        let original = arbitrary_domainname();

        let mut buffer = WritableBuffer::default();
        original.clone().serialise(&mut buffer);
        let deserialised = DomainName::deserialise(0, &mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

// repeated names compress to pointers on the wire, but the parsed
// message is indistinguishable from the uncompressed original
#[test]
fn compression_is_invisible_after_parsing() {
    for _ in 0..100 {
        let name = arbitrary_domainname();
        let mut message = Message::from_question(
            Faker.fake(),
            Question {
                name: name.clone(),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );
        message.header.is_response = true;
        for _ in 0..(2..6).fake::<usize>() {
            message.answers.push(ResourceRecord {
                name: name.clone(),
                rtype_with_data: RecordTypeWithData::A {
                    address: std::net::Ipv4Addr::from(Faker.fake::<u32>()),
                },
                rclass: RecordClass::IN,
                ttl: (0..100_000).fake(),
            });
        }

        let octets = message.clone().into_octets().unwrap();

        // one full name plus a two-octet pointer per repetition
        let uncompressed_len = 12
            + (name.octets.len() + 4)
            + message.answers.len() * (name.octets.len() + 14);
        assert!(octets.len() < uncompressed_len);

        assert_eq!(Ok(message), Message::from_octets(&octets));
    }
}

fn arbitrary_message() -> Message {
    let qdcount = (0..4).fake::<u16>();
    let ancount = (0..4).fake::<u16>();
    let nscount = (0..4).fake::<u16>();
    let arcount = (0..4).fake::<u16>();

    let mut questions = Vec::with_capacity(qdcount as usize);
    let mut answers = Vec::with_capacity(ancount as usize);
    let mut authority = Vec::with_capacity(nscount as usize);
    let mut additional = Vec::with_capacity(arcount as usize);

    for _ in 0..qdcount {
        questions.push(arbitrary_question());
    }
    for _ in 0..ancount {
        answers.push(arbitrary_resourcerecord());
    }
    for _ in 0..nscount {
        authority.push(arbitrary_resourcerecord());
    }
    for _ in 0..arcount {
        additional.push(arbitrary_resourcerecord());
    }

    Message {
        header: arbitrary_header(),
        questions,
        answers,
        authority,
        additional,
    }
}

fn arbitrary_header() -> Header {
    Header {
        id: Faker.fake(),
        is_response: Faker.fake(),
        opcode: (Faker.fake::<u8>() & 0b0000_1111).into(),
        is_authoritative: Faker.fake(),
        is_truncated: Faker.fake(),
        recursion_desired: Faker.fake(),
        recursion_available: Faker.fake(),
        rcode: (Faker.fake::<u8>() & 0b0000_1111).into(),
    }
}

fn arbitrary_question() -> Question {
    Question {
        name: arbitrary_domainname(),
        qtype: Faker.fake::<u16>().into(),
        qclass: Faker.fake::<u16>().into(),
    }
}

fn arbitrary_resourcerecord() -> ResourceRecord {
    // this should match the `RecordTypeWithData` deserialisation
    let rtype_with_data = match Faker.fake::<u16>().into() {
        RecordType::A => RecordTypeWithData::A {
            address: std::net::Ipv4Addr::from(Faker.fake::<u32>()),
        },
        RecordType::NS => RecordTypeWithData::NS {
            nsdname: arbitrary_domainname(),
        },
        RecordType::CNAME => RecordTypeWithData::CNAME {
            cname: arbitrary_domainname(),
        },
        RecordType::SOA => RecordTypeWithData::SOA {
            mname: arbitrary_domainname(),
            rname: arbitrary_domainname(),
            serial: Faker.fake(),
            refresh: Faker.fake(),
            retry: Faker.fake(),
            expire: Faker.fake(),
            minimum: Faker.fake(),
        },
        RecordType::PTR => RecordTypeWithData::PTR {
            ptrdname: arbitrary_domainname(),
        },
        RecordType::MX => RecordTypeWithData::MX {
            preference: Faker.fake(),
            exchange: arbitrary_domainname(),
        },
        RecordType::TXT => RecordTypeWithData::TXT {
            octets: arbitrary_octets((1..64).fake()),
        },
        RecordType::AAAA => RecordTypeWithData::AAAA {
            address: std::net::Ipv6Addr::from(Faker.fake::<u128>()),
        },
        RecordType::SRV => RecordTypeWithData::SRV {
            priority: Faker.fake(),
            weight: Faker.fake(),
            port: Faker.fake(),
            target: arbitrary_domainname(),
        },
        RecordType::OPT => RecordTypeWithData::OPT {
            octets: arbitrary_octets((0..64).fake()),
        },
        RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
            tag,
            octets: arbitrary_octets((0..64).fake()),
        },
    };

    ResourceRecord {
        name: arbitrary_domainname(),
        rtype_with_data,
        rclass: Faker.fake::<u16>().into(),
        ttl: Faker.fake(),
    }
}

fn arbitrary_domainname() -> DomainName {
    let num_labels = (1..5).fake::<usize>();
    let mut labels = Vec::with_capacity(num_labels + 1);

    for _ in 0..num_labels {
        let label_len = (1..16).fake::<usize>();
        let mut octets = Vec::with_capacity(label_len);
        for _ in 0..label_len {
            octets.push(Faker.fake::<u8>().to_ascii_lowercase());
        }
        labels.push(Label::try_from(&octets[..]).unwrap());
    }

    labels.push(Label::new());
    DomainName::from_labels(labels).unwrap()
}

fn arbitrary_octets(len: usize) -> bytes::Bytes {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(Faker.fake());
    }
    bytes::Bytes::from(out)
}
