mod derive_message;

use derive_message::DeriveMessage;
use proc_macro::TokenStream;
use quote::ToTokens;
use syn::parse_macro_input;

/// Derive macro implementing the `Message` trait.
///
/// The `#[message(op_code = ...)]` attribute on the type sets the op code identifying the message on the wire.
///
/// The pool flag field is the one marked `#[message(pool_flag)]`. When no field is marked, the single field of
/// type `PoolFlag` is used.
///
/// # Example
///
/// ```ignore
/// use shardline::message::{Message, PoolFlag};
///
/// #[derive(Message, Default)]
/// #[message(op_code = 1201)]
/// struct EnterMap {
///     #[message(pool_flag)]
///     pooled: PoolFlag,
///     map_id: u32,
/// }
///
/// assert_eq!(EnterMap::default().op_code(), 1201);
/// ```
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
    let derive_message = parse_macro_input!(input as DeriveMessage);
    TokenStream::from(derive_message.into_token_stream())
}
