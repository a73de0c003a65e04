//! Invoice domain module (event-sourced).
//!
//! Invoices are opened for a contract, filled with their full set of lines by the
//! billing run, then moved through their payment statuses.

pub mod invoice;

pub use invoice::{
    CreateInvoiceForContract, DeleteInvoice, FillInvoice, FillLine, Invoice, InvoiceCommand,
    InvoiceCreated, InvoiceDeleted, InvoiceEvent, InvoiceField, InvoiceFilled, InvoiceLine,
    InvoiceStatus, InvoiceUpdated, InvoiceVoided, UpdateInvoice, VoidInvoice,
};
