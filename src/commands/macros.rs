/// Implements [`serde::Serialize`] for a request without parameters, which
/// the SMP protocol expects to be an empty CBOR map.
macro_rules! impl_serialize_as_empty_map {
    ($type:ty) => {
        impl serde::Serialize for $type {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                use serde::ser::SerializeMap;
                serializer.serialize_map(Some(0))?.end()
            }
        }
    };
}

/// Implements [`serde::Deserialize`] for a response that carries no
/// interesting payload. Any keys the server chooses to send are ignored,
/// and `From<$type> for ()` allows `.map(Into::into)` at the call site.
macro_rules! impl_deserialize_from_empty_map_and_into_unit {
    ($type:ty) => {
        impl<'de> serde::Deserialize<'de> for $type {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct MapVisitor;
                impl<'de> serde::de::Visitor<'de> for MapVisitor {
                    type Value = $type;

                    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                        formatter.write_str("a map")
                    }

                    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
                    where
                        A: serde::de::MapAccess<'de>,
                    {
                        while map
                            .next_entry::<serde::de::IgnoredAny, serde::de::IgnoredAny>()?
                            .is_some()
                        {}
                        Ok(<$type>::default())
                    }
                }
                deserializer.deserialize_map(MapVisitor)
            }
        }

        impl From<$type> for () {
            fn from(_: $type) {}
        }
    };
}

/// Asserts that a command encodes to the expected CBOR map and that the
/// expected response CBOR decodes to the expected response value.
#[cfg(test)]
macro_rules! command_encode_decode_test {
    (
        $name:ident,
        ($op:expr, $group:expr, $command:expr),
        $request:expr,
        $request_cbor:expr,
        $response_cbor:expr,
        $response:expr,
    ) => {
        #[test]
        fn $name() {
            use $crate::commands::McuMgrCommand;

            fn consts_of<R: McuMgrCommand>(_: &R) -> (u8, u16, u8) {
                (
                    if R::WRITE_OPERATION { 2 } else { 0 },
                    R::GROUP_ID,
                    R::COMMAND_ID,
                )
            }

            fn decode_response_for<R: McuMgrCommand>(_: &R, data: &[u8]) -> R::Response {
                ciborium::from_reader(data).unwrap()
            }

            let request = $request;
            assert_eq!(consts_of(&request), ($op, $group, $command));

            let mut encoded = Vec::new();
            ciborium::into_writer(&request, &mut encoded).unwrap();
            let mut expected = Vec::new();
            ciborium::into_writer(&$request_cbor.unwrap(), &mut expected).unwrap();
            assert_eq!(encoded, expected, "encoded request does not match");

            let mut response_data = Vec::new();
            ciborium::into_writer(&$response_cbor.unwrap(), &mut response_data).unwrap();
            let response = decode_response_for(&request, &response_data);
            assert_eq!(response, $response);
        }
    };
}

#[cfg(test)]
pub(crate) use command_encode_decode_test;
pub(crate) use {impl_deserialize_from_empty_map_and_into_unit, impl_serialize_as_empty_map};
