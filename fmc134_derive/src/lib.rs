use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, LitInt};

#[proc_macro_derive(RegisterByte)]
/// Derived on a single-byte packed_struct to convert it to and from the byte carried in a chip
/// register transaction
pub fn derive_register_byte(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let reg_name = input.ident;
    let generated = quote! {
        impl ::fmc134::registers::RegisterByte for #reg_name {
            fn to_byte(&self) -> ::core::result::Result<u8, ::packed_struct::PackingError> {
                let packed = <Self as ::packed_struct::PackedStruct>::pack(self)?;
                Ok(packed[0])
            }

            fn from_byte(byte: u8) -> ::core::result::Result<Self, ::packed_struct::PackingError> {
                <Self as ::packed_struct::PackedStruct>::unpack(&[byte])
            }
        }
    };
    TokenStream::from(generated)
}

#[proc_macro_attribute]
/// Attaches the chip sub-address to a register definition
pub fn address(attr: TokenStream, item: TokenStream) -> TokenStream {
    let num = parse_macro_input!(attr as LitInt);
    // Get the struct name this address is for
    let item = parse_macro_input!(item as DeriveInput);
    let ident = item.ident.clone();

    let generated = quote! {
        impl ::fmc134::registers::Address for #ident {
            const ADDRESS: u16 = #num;
        }
        #item
    };
    TokenStream::from(generated)
}
