use crate::error::SagaResult;
use std::io::{prelude::*, BufReader};

pub trait Serialize {
    fn serialize(&self, writer: &mut dyn Write) -> SagaResult<()>;

    fn to_bytes(&self) -> SagaResult<Vec<u8>> {
        let mut buf = vec![];
        self.serialize(&mut buf)?;
        Ok(buf)
    }
}

pub trait Deserialize {
    fn deserialize(reader: &mut impl BufRead) -> SagaResult<Self>
    where
        Self: Sized;

    fn deserialize_unbuffered(reader: impl Read) -> SagaResult<Self>
    where
        Self: Sized,
    {
        Self::deserialize(&mut BufReader::new(reader))
    }

    fn deserialize_from_slice(mut slice: &[u8]) -> SagaResult<Self>
    where
        Self: Sized,
    {
        Self::deserialize(&mut slice)
    }
}
